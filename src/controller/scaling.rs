//! Scale-up and scale-down decisions for instance sets

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;

use crate::controller::instance::ObservedInstances;
use crate::controller::role::role_from_label;
use crate::crd::{PostgresCluster, PostgresInstanceSetSpec};
use crate::resources::naming::{
    self, LABEL_INSTANCE, LABEL_INSTANCE_SET, LABEL_ROLE, ROLE_POSTGRES_DATA, ROLE_POSTGRES_WAL,
};

/// Pods to retain when each set is scaled to the desired count.
///
/// Within a set the pod Patroni labels as primary is kept first, then the
/// remaining quota is filled in observation order. Sets missing from
/// `desired` keep nothing; pods without a set label are never kept.
pub fn pods_to_keep<'a>(pods: &'a [Pod], desired: &BTreeMap<String, i32>) -> Vec<&'a Pod> {
    let mut set_order: Vec<&str> = Vec::new();
    let mut by_set: BTreeMap<&str, Vec<&'a Pod>> = BTreeMap::new();

    for pod in pods {
        let Some(set) = pod.labels().get(LABEL_INSTANCE_SET) else {
            continue;
        };
        let entry = by_set.entry(set.as_str()).or_default();
        if entry.is_empty() {
            set_order.push(set.as_str());
        }
        entry.push(pod);
    }

    let mut keep = Vec::new();
    for set in set_order {
        let want = desired
            .get(set)
            .copied()
            .unwrap_or(0)
            .max(0) as usize;
        let members = &by_set[set];

        let primary = members
            .iter()
            .position(|p| role_from_label(p).is_primary());

        let mut kept = Vec::with_capacity(want);
        if let Some(idx) = primary.filter(|_| want > 0) {
            kept.push(members[idx]);
        }
        for (idx, pod) in members.iter().enumerate() {
            if kept.len() >= want {
                break;
            }
            if Some(idx) != primary {
                kept.push(*pod);
            }
        }
        keep.extend(kept);
    }
    keep
}

/// Instance names of a set whose storage already exists but which have no
/// StatefulSet, in volume discovery order.
///
/// Volumes being deleted are ignored. When the set asks for a WAL volume,
/// a name only qualifies if both its data and WAL volumes exist.
pub fn find_available_instance_names(
    set: &PostgresInstanceSetSpec,
    observed: &ObservedInstances,
    volumes: &[PersistentVolumeClaim],
) -> Vec<String> {
    let in_set = |pvc: &&PersistentVolumeClaim, role: &str| {
        let labels = pvc.labels();
        pvc.metadata.deletion_timestamp.is_none()
            && labels.get(LABEL_ROLE).map(String::as_str) == Some(role)
            && labels.get(LABEL_INSTANCE_SET) == Some(&set.name)
    };

    let wal_instances: BTreeSet<&str> = volumes
        .iter()
        .filter(|pvc| in_set(pvc, ROLE_POSTGRES_WAL))
        .filter_map(|pvc| pvc.labels().get(LABEL_INSTANCE).map(String::as_str))
        .collect();

    let mut seen = BTreeSet::new();
    volumes
        .iter()
        .filter(|pvc| in_set(pvc, ROLE_POSTGRES_DATA))
        .filter_map(|pvc| pvc.labels().get(LABEL_INSTANCE).map(String::as_str))
        .filter(|name| {
            observed
                .get(name)
                .is_none_or(|instance| instance.runner.is_none())
        })
        .filter(|name| set.wal_volume_claim_spec.is_none() || wal_instances.contains(name))
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

/// Replica count (0 or 1) for the StatefulSet of an instance.
///
/// Once a startup instance is recorded it boots alone: other instances wait
/// until the cluster has pods. During shutdown the startup instance is the
/// last to stop.
pub fn instance_replicas(cluster: &PostgresCluster, instance_name: &str, num_pods: usize) -> i32 {
    let startup = cluster
        .status
        .as_ref()
        .map(|s| s.startup_instance.as_str())
        .unwrap_or_default();

    if !cluster.spec.is_shutdown() {
        if num_pods == 0 && !startup.is_empty() && startup != instance_name {
            return 0;
        }
        return 1;
    }

    if num_pods > 1 && (startup.is_empty() || startup == instance_name) {
        1
    } else {
        0
    }
}

/// Names of the instances to create so a set reaches its replica count.
///
/// Previously used names with storage are reused before new names are
/// minted.
pub fn plan_instance_set(
    cluster: &PostgresCluster,
    set: &PostgresInstanceSetSpec,
    observed: &ObservedInstances,
    volumes: &[PersistentVolumeClaim],
) -> Vec<String> {
    let existing = observed.in_set(&set.name).count();
    let missing = (set.replicas.max(0) as usize).saturating_sub(existing);
    if missing == 0 {
        return Vec::new();
    }

    let mut names: Vec<String> = find_available_instance_names(set, observed, volumes)
        .into_iter()
        .take(missing)
        .collect();

    while names.len() < missing {
        let name = naming::generate_instance_name(cluster, set);
        if observed.get(&name).is_none() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}
