//! Observed instances of a cluster
//!
//! An instance is a logical member of the cluster. It is reassembled on
//! every pass from whatever StatefulSets, pods, and instance set specs
//! reference its name, so any of the three may be missing.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;
use tracing::warn;

use crate::controller::role::{role_from_annotation, role_from_label};
use crate::crd::{PostgresCluster, PostgresInstanceSetSpec};
use crate::resources::naming::{LABEL_INSTANCE, LABEL_INSTANCE_SET};

/// A logical cluster member
#[derive(Clone, Debug, Default)]
pub struct Instance {
    pub name: String,
    /// Instance set named by the labels of the first object seen
    pub set_name: String,
    pub pods: Vec<Pod>,
    /// StatefulSet running the instance, if any
    pub runner: Option<StatefulSet>,
    /// Desired spec of the instance set, absent when the set was removed
    pub spec: Option<PostgresInstanceSetSpec>,
}

impl Instance {
    /// `(running, known)` for the named container of the first pod.
    ///
    /// Init containers are consulted too. The answer is unknown when there
    /// are no pods or no status for the container.
    pub fn is_running(&self, container: &str) -> (bool, bool) {
        let Some(pod) = self.pods.first() else {
            return (false, false);
        };
        let Some(status) = pod.status.as_ref() else {
            return (false, false);
        };

        let find = |statuses: &Option<Vec<ContainerStatus>>| {
            statuses
                .as_ref()
                .and_then(|s| s.iter().find(|cs| cs.name == container).cloned())
        };

        match find(&status.container_statuses).or_else(|| find(&status.init_container_statuses)) {
            Some(cs) => {
                let running = cs.state.as_ref().is_some_and(|s| s.running.is_some());
                (running, true)
            }
            None => (false, false),
        }
    }

    /// `(writable, known)` from the Patroni status annotation of the first pod
    pub fn is_writable(&self) -> (bool, bool) {
        let Some(pod) = self.pods.first() else {
            return (false, false);
        };
        let role = role_from_annotation(pod);
        (role.is_primary(), role.is_known())
    }

    /// `(primary, known)`, falling back to the Patroni role label when the
    /// status annotation does not name a role
    pub fn is_primary(&self) -> (bool, bool) {
        let Some(pod) = self.pods.first() else {
            return (false, false);
        };
        let role = match role_from_annotation(pod) {
            role if role.is_known() => role,
            _ => role_from_label(pod),
        };
        (role.is_primary(), role.is_known())
    }

    /// `(terminating, known)`; any pod marked for deletion counts
    pub fn is_terminating(&self) -> (bool, bool) {
        if self.pods.is_empty() {
            return (false, false);
        }
        let terminating = self
            .pods
            .iter()
            .any(|p| p.metadata.deletion_timestamp.is_some());
        (terminating, true)
    }
}

/// Immutable snapshot of every instance of one cluster
#[derive(Clone, Debug, Default)]
pub struct ObservedInstances {
    for_cluster: Vec<Instance>,
    by_name: BTreeMap<String, usize>,
    by_set: BTreeMap<String, Vec<usize>>,
    set_names: BTreeSet<String>,
}

impl ObservedInstances {
    /// Index a list of instances, keeping their order
    pub fn from_instances(instances: Vec<Instance>) -> Self {
        let mut observed = ObservedInstances::default();
        for (idx, instance) in instances.iter().enumerate() {
            observed.by_name.insert(instance.name.clone(), idx);
            observed
                .by_set
                .entry(instance.set_name.clone())
                .or_default()
                .push(idx);
            observed.set_names.insert(instance.set_name.clone());
        }
        observed.for_cluster = instances;
        observed
    }

    /// All instances in observation order
    pub fn instances(&self) -> &[Instance] {
        &self.for_cluster
    }

    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.by_name.get(name).map(|&idx| &self.for_cluster[idx])
    }

    /// Instances belonging to a set, in observation order
    pub fn in_set<'a>(&'a self, set_name: &str) -> impl Iterator<Item = &'a Instance> + 'a {
        self.by_set
            .get(set_name)
            .into_iter()
            .flatten()
            .map(|&idx| &self.for_cluster[idx])
    }

    pub fn set_names(&self) -> &BTreeSet<String> {
        &self.set_names
    }

    pub fn len(&self) -> usize {
        self.for_cluster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.for_cluster.is_empty()
    }

    /// Total number of pods across all instances
    pub fn pod_count(&self) -> usize {
        self.for_cluster.iter().map(|i| i.pods.len()).sum()
    }

    /// First instance that is running, writable, and not terminating.
    ///
    /// More than one candidate means Patroni reported two leaders; the first
    /// one in snapshot order is returned.
    pub fn writable_pod(&self, container: &str) -> Option<(&Pod, &Instance)> {
        let candidates: Vec<&Instance> = self
            .for_cluster
            .iter()
            .filter(|instance| {
                let (terminating, known_terminating) = instance.is_terminating();
                let (writable, known_writable) = instance.is_writable();
                let (running, known_running) = instance.is_running(container);
                known_terminating
                    && !terminating
                    && known_writable
                    && writable
                    && known_running
                    && running
            })
            .collect();

        if candidates.len() > 1 {
            let names: Vec<&str> = candidates.iter().map(|i| i.name.as_str()).collect();
            warn!(
                candidates = ?names,
                "multiple writable instances observed, using the first"
            );
        }

        candidates
            .into_iter()
            .next()
            .and_then(|instance| instance.pods.first().map(|pod| (pod, instance)))
    }
}

fn label<'a>(labels: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    labels.get(key).map(String::as_str).unwrap_or_default()
}

/// Correlate the StatefulSets and pods of a cluster into instances.
///
/// StatefulSets are registered first and matched to the instance set spec
/// of the same name. Pods then attach to the instance named by their label,
/// creating a pods-only instance when none exists yet.
pub fn new_observed_instances(
    cluster: &PostgresCluster,
    runners: &[StatefulSet],
    pods: &[Pod],
) -> ObservedInstances {
    let mut instances: Vec<Instance> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for runner in runners {
        let name = runner.name_any();
        let set_name = label(runner.labels(), LABEL_INSTANCE_SET).to_string();

        if let Some(&idx) = index.get(&name) {
            instances[idx].runner = Some(runner.clone());
            continue;
        }

        index.insert(name.clone(), instances.len());
        instances.push(Instance {
            spec: cluster.spec.instance_set(&set_name).cloned(),
            name,
            set_name,
            pods: Vec::new(),
            runner: Some(runner.clone()),
        });
    }

    for pod in pods {
        let name = label(pod.labels(), LABEL_INSTANCE).to_string();

        match index.get(&name) {
            Some(&idx) => instances[idx].pods.push(pod.clone()),
            None => {
                index.insert(name.clone(), instances.len());
                instances.push(Instance {
                    name,
                    set_name: label(pod.labels(), LABEL_INSTANCE_SET).to_string(),
                    pods: vec![pod.clone()],
                    runner: None,
                    spec: None,
                });
            }
        }
    }

    ObservedInstances::from_instances(instances)
}
