use k8s_openapi::api::core::v1::{
    Affinity, PersistentVolumeClaimSpec, Toleration, TopologySpreadConstraint,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"integer", "jsonPath":".spec.postgresVersion"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.primaryInstance"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Major PostgreSQL version the cluster runs (e.g. 16)
    pub postgres_version: i32,

    /// Container image for PostgreSQL + Patroni
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Ordered list of instance sets. The first set is used to bootstrap
    /// a cluster that has no recorded startup instance.
    #[serde(default)]
    pub instance_sets: Vec<PostgresInstanceSetSpec>,

    /// Scale every instance to zero, replicas first and the primary last
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<bool>,

    /// Major version upgrade request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<PgMajorUpgrade>,
}

impl PostgresClusterSpec {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.unwrap_or(false)
    }

    /// Look up an instance set by name
    pub fn instance_set(&self, name: &str) -> Option<&PostgresInstanceSetSpec> {
        self.instance_sets.iter().find(|set| set.name == name)
    }
}

/// A named group of homogeneous instances
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresInstanceSetSpec {
    /// Name of the set; used in instance names and labels
    pub name: String,

    /// Number of instances in this set
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Claim template for the data volume of each instance
    #[serde(default)]
    pub data_volume_claim_spec: PersistentVolumeClaimSpec,

    /// Claim template for a dedicated WAL volume. When set, an instance is
    /// only complete when both its data and WAL volumes exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_volume_claim_spec: Option<PersistentVolumeClaimSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_spread_constraints: Option<Vec<TopologySpreadConstraint>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

/// Major version upgrade configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgMajorUpgrade {
    /// Whether the upgrade should run
    #[serde(default)]
    pub enabled: bool,

    /// Major version the data directory is currently at
    pub from_postgres_version: i32,

    /// Image containing pg_upgrade and both sets of binaries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Status of the PostgresCluster
///
/// Written back with a merge patch, so cleared identity fields serialize as
/// empty values rather than being omitted.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Kubernetes-style conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Instance that must start first (and stop last)
    #[serde(default)]
    pub startup_instance: String,

    /// Instance set of the startup instance
    #[serde(default)]
    pub startup_instance_set: String,

    /// Name of the instance currently reported as writable
    #[serde(default)]
    pub primary_instance: Option<String>,

    #[serde(default)]
    pub patroni: PatroniStatus,

    #[serde(default)]
    pub proxy: ProxyStatus,

    #[serde(default)]
    pub monitoring: MonitoringStatus,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Identity Patroni reported for the current data directory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatroniStatus {
    #[serde(default)]
    pub system_identifier: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    #[serde(default)]
    pub pg_bouncer: PgBouncerStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerStatus {
    /// Revision of the PostgreSQL objects PgBouncer authenticates through
    #[serde(default)]
    pub postgres_revision: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatus {
    /// Hash of the exporter configuration last installed
    #[serde(default)]
    pub exporter_configuration: String,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
