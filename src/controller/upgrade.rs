//! Major version upgrade orchestration
//!
//! A pg_upgrade run needs the whole cluster stopped and Patroni's
//! coordination state removed, otherwise members would rejoin with the old
//! system identifier. The phase is never stored; each pass derives it from
//! the Endpoints, the Job, and the cluster conditions.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::client::ClusterClient;
use crate::controller::error::{Error, Result};
use crate::controller::instance::ObservedInstances;
use crate::controller::status::{
    self, condition_reasons, condition_status, condition_types, find_condition,
};
use crate::crd::PostgresCluster;
use crate::resources::naming;
use crate::resources::upgrade_job::{UpgradeJobInputs, generate_upgrade_job};

/// Coordination objects and upgrade Job seen in one pass
#[derive(Clone, Debug, Default)]
pub struct UpgradeEnvironment {
    /// Patroni Endpoints that still exist
    pub endpoints: Vec<Endpoints>,
    pub job: Option<Job>,
}

/// Where an upgrade stands, derived from what is observed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradePhase {
    /// No upgrade requested
    Idle,
    /// Patroni Endpoints must be removed before anything else
    AwaitingTeardown,
    /// Ready for the Job to be created
    Preparing,
    /// Job exists and has not finished
    Running,
    Completed { succeeded: bool },
}

impl UpgradePhase {
    /// Derive the phase after [`observe_upgrade_env`] has updated conditions
    pub fn derive(cluster: &PostgresCluster, env: &UpgradeEnvironment) -> Self {
        if !upgrade_enabled(cluster) {
            return UpgradePhase::Idle;
        }
        if !env.endpoints.is_empty() {
            return UpgradePhase::AwaitingTeardown;
        }
        if find_condition(cluster, condition_types::PG_UPGRADE_COMPLETED)
            .is_some_and(|c| c.status == condition_status::TRUE)
        {
            return UpgradePhase::Completed { succeeded: true };
        }
        match &env.job {
            None => UpgradePhase::Preparing,
            Some(job) if job_condition(job, "Failed") => UpgradePhase::Completed { succeeded: false },
            Some(_) => UpgradePhase::Running,
        }
    }

    /// Whether the rest of the pass must wait for the upgrade
    pub fn blocks_reconcile(self) -> bool {
        !matches!(
            self,
            UpgradePhase::Idle | UpgradePhase::Completed { succeeded: true }
        )
    }
}

fn upgrade_enabled(cluster: &PostgresCluster) -> bool {
    cluster.spec.upgrade.as_ref().is_some_and(|u| u.enabled)
}

fn job_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == type_ && c.status == condition_status::TRUE)
        })
}

/// Fetch the Patroni Endpoints and the upgrade Job, and record the Job's
/// outcome once it has finished.
pub async fn observe_upgrade_env(
    client: &dyn ClusterClient,
    cluster: &mut PostgresCluster,
) -> Result<UpgradeEnvironment> {
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    let mut endpoints = Vec::new();
    for name in naming::patroni_endpoints(cluster) {
        if let Some(ep) = client.get_endpoints(&namespace, &name).await? {
            endpoints.push(ep);
        }
    }

    let selector = naming::pg_upgrade_job_selector(&cluster.name_any());
    let job = client
        .list_jobs(&namespace, &selector)
        .await?
        .into_iter()
        .next();

    if let Some(job) = &job {
        if job_condition(job, "Complete") {
            status::set_condition(
                cluster,
                condition_types::PG_UPGRADE_COMPLETED,
                condition_status::TRUE,
                condition_reasons::PG_UPGRADE_COMPLETE,
                "pg_upgrade completed successfully",
            );
        } else if job_condition(job, "Failed") {
            status::set_condition(
                cluster,
                condition_types::PG_UPGRADE_COMPLETED,
                condition_status::FALSE,
                condition_reasons::PG_UPGRADE_FAILED,
                "pg_upgrade failed",
            );
        }
    }

    debug!(
        endpoints = endpoints.len(),
        job = job.is_some(),
        "observed upgrade environment"
    );
    Ok(UpgradeEnvironment { endpoints, job })
}

/// Clear the way for a new upgrade Job.
///
/// A leftover Job is removed first. Once none remains, the Patroni
/// Endpoints are deleted and every identity cached from the old data
/// directory is dropped from the status. With neither left there is
/// nothing to do.
pub async fn prepare_for_upgrade(
    client: &dyn ClusterClient,
    cluster: &mut PostgresCluster,
    observed: &ObservedInstances,
    env: &UpgradeEnvironment,
) -> Result<()> {
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    if let Some(job) = &env.job {
        info!(job = %job.name_any(), "removing existing upgrade job");
        client.delete_job(&namespace, &job.name_any()).await?;
        status::set_condition(
            cluster,
            condition_types::PG_UPGRADE_PROGRESSING,
            condition_status::TRUE,
            condition_reasons::PG_UPGRADE_REQUESTED,
            "Preparing cluster for upgrade: removing existing upgrade job",
        );
        return Ok(());
    }

    if env.endpoints.is_empty() {
        return Ok(());
    }

    for ep in &env.endpoints {
        client.delete_endpoints(&namespace, &ep.name_any()).await?;
    }
    info!(
        count = env.endpoints.len(),
        "removed patroni endpoints for upgrade"
    );

    let primary = observed.instances().iter().find(|instance| {
        let (primary, known) = instance.is_primary();
        primary && known && instance.spec.is_some()
    });
    let recorded = cluster
        .status
        .as_ref()
        .filter(|s| !s.startup_instance.is_empty())
        .map(|s| (s.startup_instance.clone(), s.startup_instance_set.clone()));
    let (startup, startup_set) = match (primary, recorded) {
        (Some(instance), _) => (instance.name.clone(), instance.set_name.clone()),
        (None, Some(recorded)) => recorded,
        (None, None) => {
            let first = cluster.spec.instance_sets.first().ok_or_else(|| {
                Error::ValidationError("cluster has no instance sets to upgrade".to_string())
            })?;
            let generated = naming::generate_startup_instance(cluster, first);
            warn!(
                instance = %generated.name,
                "no primary instance found, generated a startup instance"
            );
            (generated.name, generated.set_name)
        }
    };

    let status_block = status::status_mut(cluster);
    status_block.startup_instance = startup;
    status_block.startup_instance_set = startup_set;
    clear_cached_identities(cluster);
    status::set_condition(
        cluster,
        condition_types::PG_UPGRADE_PROGRESSING,
        condition_status::TRUE,
        condition_reasons::PG_UPGRADE_READY_FOR_UPGRADE,
        "Upgrading cluster postgres major version",
    );
    Ok(())
}

/// Forget what was learned about the old data directory
fn clear_cached_identities(cluster: &mut PostgresCluster) {
    let status_block = status::status_mut(cluster);
    status_block.patroni.system_identifier.clear();
    status_block.proxy.pg_bouncer.postgres_revision.clear();
    status_block.monitoring.exporter_configuration.clear();
    status::remove_condition(cluster, condition_types::POSTGRES_DATA_INITIALIZED);
}

/// Drive the upgrade one step. Returns `true` when the rest of the pass
/// must stop and wait.
pub async fn reconcile_upgrade_job(
    client: &dyn ClusterClient,
    cluster: &mut PostgresCluster,
    observed: &ObservedInstances,
    inputs: &UpgradeJobInputs,
) -> Result<bool> {
    let Some(upgrade) = cluster.spec.upgrade.clone().filter(|u| u.enabled) else {
        // A later upgrade starts from a clean slate
        status::remove_condition(cluster, condition_types::PG_UPGRADE_COMPLETED);
        status::remove_condition(cluster, condition_types::PG_UPGRADE_PROGRESSING);
        return Ok(false);
    };

    let env = observe_upgrade_env(client, cluster).await?;
    let phase = UpgradePhase::derive(cluster, &env);
    debug!(?phase, "upgrade phase");

    match phase {
        UpgradePhase::Idle => Ok(false),
        UpgradePhase::Completed { succeeded: true } => {
            status::set_condition(
                cluster,
                condition_types::PG_UPGRADE_PROGRESSING,
                condition_status::FALSE,
                condition_reasons::PG_UPGRADE_COMPLETE,
                "pg_upgrade completed successfully",
            );
            Ok(false)
        }
        UpgradePhase::AwaitingTeardown => {
            prepare_for_upgrade(client, cluster, observed, &env).await?;
            Ok(true)
        }
        UpgradePhase::Preparing => {
            prepare_for_upgrade(client, cluster, observed, &env).await?;

            let namespace = cluster
                .namespace()
                .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
            let (instance, set_name) = upgrade_target(cluster, observed)?;
            let set = cluster.spec.instance_set(&set_name);
            let job = generate_upgrade_job(cluster, &upgrade, set, &instance, inputs);
            status::remove_condition(cluster, condition_types::PG_UPGRADE_COMPLETED);
            // Endpoints removed by someone else leave these behind
            clear_cached_identities(cluster);

            info!(%instance, job = %job.name_any(), "creating upgrade job");
            client.apply_job(&namespace, &job).await?;
            Ok(true)
        }
        UpgradePhase::Running => Ok(true),
        UpgradePhase::Completed { succeeded: false } => {
            warn!("upgrade job failed; disable the upgrade or delete the job to retry");
            Ok(true)
        }
    }
}

/// Instance whose data directory the Job upgrades.
///
/// The recorded startup instance wins, then the observed primary. With
/// neither, a startup instance is generated for the first set and recorded.
fn upgrade_target(
    cluster: &mut PostgresCluster,
    observed: &ObservedInstances,
) -> Result<(String, String)> {
    if let Some(status) = cluster.status.as_ref() {
        if !status.startup_instance.is_empty() {
            return Ok((
                status.startup_instance.clone(),
                status.startup_instance_set.clone(),
            ));
        }
    }

    if let Some(instance) = observed.instances().iter().find(|i| {
        let (primary, known) = i.is_primary();
        primary && known
    }) {
        return Ok((instance.name.clone(), instance.set_name.clone()));
    }

    let first = cluster.spec.instance_sets.first().ok_or_else(|| {
        Error::ValidationError("cluster has no instance sets to upgrade".to_string())
    })?;
    let generated = naming::generate_startup_instance(cluster, first);
    let status_block = status::status_mut(cluster);
    status_block.startup_instance = generated.name.clone();
    status_block.startup_instance_set = generated.set_name.clone();
    Ok((generated.name, generated.set_name))
}
