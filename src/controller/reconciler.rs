//! Reconciliation logic for PostgresCluster resources
//!
//! A pass observes the cluster's StatefulSets, pods, and volumes, lets a
//! pending major upgrade hold everything else back, removes instances the
//! spec no longer wants, and creates or updates the rest. Status is written
//! once at the end of the pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::client::ClusterClient;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::instance::{Instance, ObservedInstances, new_observed_instances};
use crate::controller::scaling::{instance_replicas, plan_instance_set, pods_to_keep};
use crate::controller::status::{
    self, condition_reasons, condition_status, condition_types,
};
use crate::controller::upgrade::reconcile_upgrade_job;
use crate::crd::PostgresCluster;
use crate::health::HealthState;
use crate::resources::instance::{generate_instance_statefulset, generate_instance_volumes};
use crate::resources::naming::{self, CONTAINER_DATABASE};
use crate::resources::upgrade_job::UpgradeJobInputs;

/// Interval between passes when nothing triggers one sooner
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, owned objects are garbage collected");
        return Ok(Action::await_change());
    }

    info!("Reconciling PostgresCluster");
    if status::spec_changed(&cluster) {
        info!(
            observed = ?cluster.status.as_ref().and_then(|s| s.observed_generation),
            generation = ?cluster.metadata.generation,
            "Spec changed since last pass"
        );
    }

    let mut working = (*cluster).clone();
    let result =
        reconcile_cluster(&mut working, ctx.client.as_ref(), ctx.health_state.as_deref()).await;

    if let Some(state) = &ctx.health_state {
        match &result {
            Ok(_) => {
                state
                    .metrics
                    .record_reconcile(&ns, &name, started.elapsed().as_secs_f64());
                state
                    .last_reconcile
                    .store(chrono::Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
            }
            Err(_) => state.metrics.record_error(&ns, &name),
        }
    }

    match result {
        Ok(action) => {
            info!("Reconciliation completed successfully");
            Ok(action)
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let delay = BackoffConfig::default().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// One pass over a single cluster. The cluster's status is updated in
/// place and written back before returning.
pub async fn reconcile_cluster(
    cluster: &mut PostgresCluster,
    client: &dyn ClusterClient,
    health: Option<&HealthState>,
) -> Result<Action> {
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = cluster.name_any();
    let selector = naming::cluster_instances_selector(&name);

    let runners = client.list_statefulsets(&ns, &selector).await?;
    let pods = client.list_pods(&ns, &selector).await?;
    let volumes = client.list_volumes(&ns, &selector).await?;

    let observed = new_observed_instances(cluster, &runners, &pods);
    debug!(
        instances = observed.len(),
        pods = observed.pod_count(),
        "observed instances"
    );
    if let Some(state) = health {
        state
            .metrics
            .set_instances_observed(&ns, &name, observed.len() as i64);
    }

    record_writable_instance(cluster, &observed);

    // Patroni state may only be torn down once every member has stopped
    let upgrade_requested = cluster.spec.upgrade.as_ref().is_some_and(|u| u.enabled);
    let inputs = UpgradeJobInputs::for_cluster(cluster);
    if upgrade_requested && observed.pod_count() > 0 {
        if !status::is_condition_true(cluster, condition_types::PG_UPGRADE_COMPLETED) {
            wait_for_shutdown(cluster, &observed);
        }
    } else if reconcile_upgrade_job(client, cluster, &observed, &inputs).await? {
        info!("waiting on major version upgrade");
        if let Some(state) = health {
            state.metrics.record_upgrade_blocked(&ns, &name);
        }
        write_status(client, cluster, &ns).await?;
        return Ok(Action::requeue(REQUEUE_INTERVAL));
    }

    let deleted = scale_down(client, cluster, &observed, &ns).await?;
    if let Some(state) = health {
        if !deleted.is_empty() {
            state
                .metrics
                .record_instances_deleted(&ns, &name, deleted.len() as u64);
        }
    }

    apply_instance_sets(client, cluster, &observed, &volumes, &deleted, &ns).await?;

    write_status(client, cluster, &ns).await?;
    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// Record that a requested upgrade is held until every instance has stopped
fn wait_for_shutdown(cluster: &mut PostgresCluster, observed: &ObservedInstances) {
    let message = if cluster.spec.is_shutdown() {
        info!(
            pods = observed.pod_count(),
            "major upgrade requested, waiting for instances to stop"
        );
        "Waiting for every instance to stop before upgrading"
    } else {
        warn!("major upgrade requested but the cluster is not shut down");
        "Shut down the cluster to start the upgrade"
    };
    status::set_condition(
        cluster,
        condition_types::PG_UPGRADE_PROGRESSING,
        condition_status::FALSE,
        condition_reasons::PG_UPGRADE_WAITING_FOR_SHUTDOWN,
        message,
    );
}

/// Track the writable instance in status.
///
/// While shutting down it becomes the startup instance so that it stops
/// last and starts first. Once the startup instance is writable again the
/// hint is cleared.
fn record_writable_instance(cluster: &mut PostgresCluster, observed: &ObservedInstances) {
    let writable = observed
        .writable_pod(CONTAINER_DATABASE)
        .map(|(_, instance)| (instance.name.clone(), instance.set_name.clone()));
    let shutdown = cluster.spec.is_shutdown();
    let status = status::status_mut(cluster);

    status.primary_instance = writable.as_ref().map(|(name, _)| name.clone());

    match writable {
        Some((name, set)) if shutdown => {
            if status.startup_instance != name {
                info!(instance = %name, "recording startup instance for shutdown");
            }
            status.startup_instance = name;
            status.startup_instance_set = set;
        }
        Some((name, _)) if status.startup_instance == name => {
            debug!(instance = %name, "startup instance is writable, clearing hint");
            status.startup_instance.clear();
            status.startup_instance_set.clear();
        }
        _ => {}
    }
}

/// Delete instances whose pods are not retained for their set, and
/// instances without pods once their set has no room left for them.
///
/// Instances holding a kept pod use up their set's quota first. Pod-less
/// instances fill what remains, the recorded startup instance ahead of the
/// rest, and an instance whose set was removed has no quota at all.
async fn scale_down(
    client: &dyn ClusterClient,
    cluster: &PostgresCluster,
    observed: &ObservedInstances,
    ns: &str,
) -> Result<BTreeSet<String>> {
    let desired: BTreeMap<String, i32> = cluster
        .spec
        .instance_sets
        .iter()
        .map(|set| (set.name.clone(), set.replicas))
        .collect();

    let all_pods: Vec<Pod> = observed
        .instances()
        .iter()
        .flat_map(|i| i.pods.iter().cloned())
        .collect();
    let kept: BTreeSet<String> = pods_to_keep(&all_pods, &desired)
        .into_iter()
        .map(|pod| pod.name_any())
        .collect();

    let mut quota: BTreeMap<&str, usize> = desired
        .iter()
        .map(|(set, replicas)| (set.as_str(), (*replicas).max(0) as usize))
        .collect();
    let mut unwanted: Vec<&Instance> = Vec::new();
    let mut idle: Vec<&Instance> = Vec::new();

    for instance in observed.instances() {
        if instance.name.is_empty() {
            continue;
        }
        if instance.pods.is_empty() {
            if instance.spec.is_some() {
                idle.push(instance);
            } else if instance.runner.is_some() {
                unwanted.push(instance);
            }
        } else if instance.pods.iter().any(|p| kept.contains(&p.name_any())) {
            if let Some(left) = quota.get_mut(instance.set_name.as_str()) {
                *left = left.saturating_sub(1);
            }
        } else {
            unwanted.push(instance);
        }
    }

    let startup = cluster
        .status
        .as_ref()
        .map(|s| s.startup_instance.as_str())
        .unwrap_or_default();
    idle.sort_by_key(|instance| instance.name != startup);
    for instance in idle {
        match quota.get_mut(instance.set_name.as_str()) {
            Some(left) if *left > 0 => *left -= 1,
            _ => unwanted.push(instance),
        }
    }

    let mut deleted = BTreeSet::new();
    for instance in unwanted {
        delete_instance(client, cluster, instance, ns).await?;
        deleted.insert(instance.name.clone());
    }
    Ok(deleted)
}

async fn delete_instance(
    client: &dyn ClusterClient,
    cluster: &PostgresCluster,
    instance: &Instance,
    ns: &str,
) -> Result<()> {
    info!(instance = %instance.name, set = %instance.set_name, "deleting instance");

    if instance.runner.is_some() {
        client.delete_statefulset(ns, &instance.name).await?;
    } else {
        for pod in &instance.pods {
            client.delete_pod(ns, &pod.name_any()).await?;
        }
    }
    client
        .delete_volumes_for_instance(ns, &cluster.name_any(), &instance.name)
        .await
}

/// Apply the StatefulSet and volumes of every wanted instance, creating the
/// instances a set is still missing.
async fn apply_instance_sets(
    client: &dyn ClusterClient,
    cluster: &PostgresCluster,
    observed: &ObservedInstances,
    volumes: &[PersistentVolumeClaim],
    deleted: &BTreeSet<String>,
    ns: &str,
) -> Result<()> {
    let num_pods = observed.pod_count();

    for set in &cluster.spec.instance_sets {
        let mut names: Vec<String> = observed
            .in_set(&set.name)
            .filter(|i| i.spec.is_some() && !deleted.contains(&i.name))
            .map(|i| i.name.clone())
            .collect();
        let planned = plan_instance_set(cluster, set, observed, volumes);
        if !planned.is_empty() {
            info!(set = %set.name, instances = ?planned, "creating instances");
        }
        names.extend(planned);

        for instance_name in names {
            for pvc in generate_instance_volumes(cluster, set, &instance_name) {
                client.apply_volume(ns, &pvc).await?;
            }
            let replicas = instance_replicas(cluster, &instance_name, num_pods);
            let sts = generate_instance_statefulset(cluster, set, &instance_name, replicas);
            client.apply_statefulset(ns, &sts).await?;
        }
    }
    Ok(())
}

async fn write_status(
    client: &dyn ClusterClient,
    cluster: &mut PostgresCluster,
    ns: &str,
) -> Result<()> {
    let generation = cluster.metadata.generation;
    let status = status::status_mut(cluster);
    status.observed_generation = generation;
    let status = status.clone();
    client.patch_status(ns, &cluster.name_any(), &status).await
}
