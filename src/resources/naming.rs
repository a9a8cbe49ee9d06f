//! Label keys and object names shared by every resource of a cluster
//!
//! Instance, Patroni, and upgrade resources are all found again through
//! these labels, so the keys here are effectively part of the operator's
//! storage format and must not change between releases.

use std::collections::BTreeMap;

use kube::ResourceExt;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::crd::{PostgresCluster, PostgresInstanceSetSpec};

/// Cluster that owns the object
pub const LABEL_CLUSTER: &str = "postgres-operator.smoketurner.com/cluster";

/// Instance set the object belongs to
pub const LABEL_INSTANCE_SET: &str = "postgres-operator.smoketurner.com/instance-set";

/// Instance the object belongs to
pub const LABEL_INSTANCE: &str = "postgres-operator.smoketurner.com/instance";

/// Purpose of a volume (`pgdata` or `pgwal`)
pub const LABEL_ROLE: &str = "postgres-operator.smoketurner.com/role";

/// Role label Patroni maintains on each pod
pub const LABEL_PATRONI_ROLE: &str = "spilo-role";

/// Marks the pg_upgrade Job of a cluster
pub const LABEL_PG_UPGRADE: &str = "postgres-operator.smoketurner.com/pgupgrade";

/// Annotation Patroni writes with a JSON member status
pub const ANNOTATION_PATRONI_STATUS: &str = "status";

pub const ROLE_POSTGRES_DATA: &str = "pgdata";
pub const ROLE_POSTGRES_WAL: &str = "pgwal";

/// Container running PostgreSQL and Patroni
pub const CONTAINER_DATABASE: &str = "database";

/// Container running pg_upgrade
pub const CONTAINER_PG_UPGRADE: &str = "pgupgrade";

/// Name of the Endpoints Patroni uses as its leader lock
pub fn patroni_leader_endpoints(cluster: &PostgresCluster) -> String {
    format!("{}-ha", cluster.name_any())
}

/// Name of the Endpoints holding Patroni's dynamic configuration
pub fn patroni_distributed_configuration(cluster: &PostgresCluster) -> String {
    format!("{}-ha-config", cluster.name_any())
}

/// Name of the Endpoints Patroni watches for a manual failover
pub fn patroni_trigger(cluster: &PostgresCluster) -> String {
    format!("{}-ha-failover", cluster.name_any())
}

/// All coordination-layer endpoint names, leader first
pub fn patroni_endpoints(cluster: &PostgresCluster) -> [String; 3] {
    [
        patroni_leader_endpoints(cluster),
        patroni_distributed_configuration(cluster),
        patroni_trigger(cluster),
    ]
}

pub fn pg_upgrade_job(cluster: &PostgresCluster) -> String {
    format!("{}-pgupgrade", cluster.name_any())
}

pub fn pg_upgrade_job_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
        (LABEL_PG_UPGRADE.to_string(), cluster_name.to_string()),
    ])
}

/// Label selector matching the upgrade Job of a cluster
pub fn pg_upgrade_job_selector(cluster_name: &str) -> String {
    as_selector(&pg_upgrade_job_labels(cluster_name))
}

/// Label selector matching every object of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", LABEL_CLUSTER, cluster_name)
}

/// Label selector matching objects of a cluster that belong to an instance,
/// which leaves out the upgrade Job's pod
pub fn cluster_instances_selector(cluster_name: &str) -> String {
    format!("{},{}", cluster_selector(cluster_name), LABEL_INSTANCE)
}

/// Label selector matching the objects of one instance
pub fn instance_selector(cluster_name: &str, instance_name: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_CLUSTER, cluster_name, LABEL_INSTANCE, instance_name
    )
}

pub fn instance_labels(
    cluster_name: &str,
    set_name: &str,
    instance_name: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
        (LABEL_INSTANCE_SET.to_string(), set_name.to_string()),
        (LABEL_INSTANCE.to_string(), instance_name.to_string()),
    ])
}

/// Service account the instance and upgrade pods run as
pub fn instance_service_account(cluster: &PostgresCluster) -> String {
    format!("{}-instance", cluster.name_any())
}

/// Secret holding the server certificate of the cluster
pub fn cluster_certificate_secret(cluster: &PostgresCluster) -> String {
    format!("{}-cluster-cert", cluster.name_any())
}

/// Secret holding the client certificate used for replication
pub fn replication_client_secret(cluster: &PostgresCluster) -> String {
    format!("{}-replication-cert", cluster.name_any())
}

pub fn instance_data_volume(instance_name: &str) -> String {
    format!("{}-{}", instance_name, ROLE_POSTGRES_DATA)
}

pub fn instance_wal_volume(instance_name: &str) -> String {
    format!("{}-{}", instance_name, ROLE_POSTGRES_WAL)
}

/// Mint a new instance name for a set: `<cluster>-<set>-<suffix>`
pub fn generate_instance_name(cluster: &PostgresCluster, set: &PostgresInstanceSetSpec) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}-{}", cluster.name_any(), set.name, suffix)
}

/// Identity of the member that should start first when none is recorded
pub fn generate_startup_instance(
    cluster: &PostgresCluster,
    set: &PostgresInstanceSetSpec,
) -> StartupInstance {
    StartupInstance {
        name: generate_instance_name(cluster, set),
        set_name: set.name.clone(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupInstance {
    pub name: String,
    pub set_name: String,
}

fn as_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
