//! pg_upgrade Job for a major version upgrade
//!
//! The Job runs once against the data volume of the startup instance while
//! every instance is stopped. It never retries on its own; a failed run is
//! surfaced through the cluster conditions.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, KeyToPath, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ProjectedVolumeSource, SecretProjection, Volume, VolumeMount, VolumeProjection,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{PgMajorUpgrade, PostgresCluster, PostgresInstanceSetSpec};
use crate::resources::common::{owner_reference, standard_labels};
use crate::resources::instance::DEFAULT_IMAGE;
use crate::resources::naming::{self, CONTAINER_PG_UPGRADE};

const CERT_MOUNT: &str = "/pgconf/tls";

const UPGRADE_SCRIPT: &str = r#"declare -r data_volume='/pgdata' old_version="$PGVER_FROM" new_version="$PGVER_TO"
echo "Performing PostgreSQL upgrade from version ${old_version} to ${new_version}"
cd "${data_volume}"
test -d "pg${new_version}" && rm -rf "pg${new_version}"
/usr/lib/postgresql/${new_version}/bin/initdb -k -D "pg${new_version}"
/usr/lib/postgresql/${new_version}/bin/pg_upgrade \
  --old-bindir "/usr/lib/postgresql/${old_version}/bin" \
  --new-bindir "/usr/lib/postgresql/${new_version}/bin" \
  --old-datadir "pg${old_version}" --new-datadir "pg${new_version}" \
  --link
echo "Upgrade complete"
"#;

/// Everything the Job needs besides the cluster itself
#[derive(Clone, Debug, Default)]
pub struct UpgradeJobInputs {
    pub service_account: String,
    /// Server certificate projections
    pub cluster_certs: Vec<VolumeProjection>,
    /// Replication client certificate projections
    pub client_certs: Vec<VolumeProjection>,
}

impl UpgradeJobInputs {
    /// Inputs wired to the cluster's conventional service account and
    /// certificate secrets
    pub fn for_cluster(cluster: &PostgresCluster) -> Self {
        let secret = |name: String, prefix: &str| VolumeProjection {
            secret: Some(SecretProjection {
                name,
                items: Some(
                    ["ca.crt", "tls.crt", "tls.key"]
                        .iter()
                        .map(|key| KeyToPath {
                            key: key.to_string(),
                            path: format!("{}{}", prefix, key),
                            mode: Some(0o600),
                        })
                        .collect(),
                ),
                optional: Some(false),
            }),
            ..Default::default()
        };

        Self {
            service_account: naming::instance_service_account(cluster),
            cluster_certs: vec![secret(naming::cluster_certificate_secret(cluster), "")],
            client_certs: vec![secret(
                naming::replication_client_secret(cluster),
                "replication/",
            )],
        }
    }
}

/// Build the pg_upgrade Job for the cluster's startup instance
pub fn generate_upgrade_job(
    cluster: &PostgresCluster,
    upgrade: &PgMajorUpgrade,
    set: Option<&PostgresInstanceSetSpec>,
    instance_name: &str,
    inputs: &UpgradeJobInputs,
) -> Job {
    let cluster_name = cluster.name_any();
    let mut labels = standard_labels(&cluster_name);
    labels.extend(naming::pg_upgrade_job_labels(&cluster_name));

    let image = upgrade
        .image
        .clone()
        .or_else(|| cluster.spec.image.clone())
        .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

    let mut volume_mounts = vec![
        VolumeMount {
            name: "postgres-data".to_string(),
            mount_path: "/pgdata".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "cert-volume".to_string(),
            mount_path: CERT_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    let mut volumes = vec![
        Volume {
            name: "postgres-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: naming::instance_data_volume(instance_name),
                read_only: Some(false),
            }),
            ..Default::default()
        },
        Volume {
            name: "cert-volume".to_string(),
            projected: Some(ProjectedVolumeSource {
                default_mode: Some(0o600),
                sources: Some(
                    inputs
                        .cluster_certs
                        .iter()
                        .chain(inputs.client_certs.iter())
                        .cloned()
                        .collect(),
                ),
            }),
            ..Default::default()
        },
    ];
    if set.is_some_and(|s| s.wal_volume_claim_spec.is_some()) {
        volume_mounts.push(VolumeMount {
            name: "postgres-wal".to_string(),
            mount_path: "/pgwal".to_string(),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "postgres-wal".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: naming::instance_wal_volume(instance_name),
                read_only: Some(false),
            }),
            ..Default::default()
        });
    }

    let container = Container {
        name: CONTAINER_PG_UPGRADE.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "bash".to_string(),
            "-ceu".to_string(),
            "--".to_string(),
            UPGRADE_SCRIPT.to_string(),
        ]),
        env: Some(vec![
            EnvVar {
                name: "PGVER_FROM".to_string(),
                value: Some(upgrade.from_postgres_version.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "PGVER_TO".to_string(),
                value: Some(cluster.spec.postgres_version.to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(naming::pg_upgrade_job(cluster)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(inputs.service_account.clone()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    affinity: set.and_then(|s| s.affinity.clone()),
                    tolerations: set.and_then(|s| s.tolerations.clone()),
                    priority_class_name: set.and_then(|s| s.priority_class_name.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
