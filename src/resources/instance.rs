//! Workload and storage intents for a single instance
//!
//! Each instance runs in its own StatefulSet of at most one replica. Its
//! volumes are created as standalone PVCs rather than claim templates so
//! they outlive the StatefulSet and can be picked up again by name.

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, SeccompProfile, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::crd::{PostgresCluster, PostgresInstanceSetSpec};
use crate::resources::common::{instance_labels, owner_reference};
use crate::resources::naming::{self, CONTAINER_DATABASE, LABEL_ROLE};

/// PostgreSQL + Patroni image used when the cluster does not name one
pub const DEFAULT_IMAGE: &str = "ghcr.io/zalando/spilo-16:3.3-p1";

const DATA_MOUNT: &str = "/pgdata";
const WAL_MOUNT: &str = "/pgwal";

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn patroni_probe(path: &str, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(8008),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// StatefulSet running one instance with the given replica count
pub fn generate_instance_statefulset(
    cluster: &PostgresCluster,
    set: &PostgresInstanceSetSpec,
    instance_name: &str,
    replicas: i32,
) -> StatefulSet {
    let cluster_name = cluster.name_any();
    let labels = instance_labels(&cluster_name, &set.name, instance_name);
    let selector = naming::instance_labels(&cluster_name, &set.name, instance_name);
    let image = cluster
        .spec
        .image
        .clone()
        .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

    let env = vec![
        EnvVar {
            name: "PATRONI_SCOPE".to_string(),
            value: Some(format!("{}-ha", cluster_name)),
            ..Default::default()
        },
        field_env("PATRONI_KUBERNETES_NAMESPACE", "metadata.namespace"),
        field_env("PATRONI_NAME", "metadata.name"),
        field_env("POD_IP", "status.podIP"),
        EnvVar {
            name: "PATRONI_KUBERNETES_USE_ENDPOINTS".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "PATRONI_KUBERNETES_LABELS".to_string(),
            value: Some(format!(
                "{{{}: {}}}",
                naming::LABEL_CLUSTER,
                cluster_name
            )),
            ..Default::default()
        },
        EnvVar {
            name: "PGDATA".to_string(),
            value: Some(format!(
                "{}/pg{}",
                DATA_MOUNT, cluster.spec.postgres_version
            )),
            ..Default::default()
        },
        EnvVar {
            name: "PGVERSION".to_string(),
            value: Some(cluster.spec.postgres_version.to_string()),
            ..Default::default()
        },
    ];

    let mut volume_mounts = vec![VolumeMount {
        name: "postgres-data".to_string(),
        mount_path: DATA_MOUNT.to_string(),
        ..Default::default()
    }];
    let mut volumes = vec![Volume {
        name: "postgres-data".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: naming::instance_data_volume(instance_name),
            read_only: Some(false),
        }),
        ..Default::default()
    }];
    if set.wal_volume_claim_spec.is_some() {
        volume_mounts.push(VolumeMount {
            name: "postgres-wal".to_string(),
            mount_path: WAL_MOUNT.to_string(),
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
        name: CONTAINER_DATABASE.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![
            ContainerPort {
                container_port: 5432,
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: 8008,
                name: Some("patroni".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(env),
        volume_mounts: Some(volume_mounts),
        startup_probe: Some(patroni_probe("/readiness", 10, 30)),
        readiness_probe: Some(patroni_probe("/readiness", 5, 3)),
        liveness_probe: Some(patroni_probe("/liveness", 30, 6)),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(instance_name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(format!("{}-pods", cluster_name)),
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(naming::instance_service_account(cluster)),
                    containers: vec![container],
                    volumes: Some(volumes),
                    termination_grace_period_seconds: Some(30),
                    affinity: set.affinity.clone(),
                    tolerations: set.tolerations.clone(),
                    topology_spread_constraints: set.topology_spread_constraints.clone(),
                    priority_class_name: set.priority_class_name.clone(),
                    security_context: Some(PodSecurityContext {
                        fs_group: Some(103),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume(
    cluster: &PostgresCluster,
    set: &PostgresInstanceSetSpec,
    instance_name: &str,
    name: String,
    role: &str,
    spec: &k8s_openapi::api::core::v1::PersistentVolumeClaimSpec,
) -> PersistentVolumeClaim {
    let mut labels: BTreeMap<String, String> =
        instance_labels(&cluster.name_any(), &set.name, instance_name);
    labels.insert(LABEL_ROLE.to_string(), role.to_string());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(spec.clone()),
        ..Default::default()
    }
}

/// Data volume, plus a WAL volume when the set declares one
pub fn generate_instance_volumes(
    cluster: &PostgresCluster,
    set: &PostgresInstanceSetSpec,
    instance_name: &str,
) -> Vec<PersistentVolumeClaim> {
    let mut volumes = vec![volume(
        cluster,
        set,
        instance_name,
        naming::instance_data_volume(instance_name),
        naming::ROLE_POSTGRES_DATA,
        &set.data_volume_claim_spec,
    )];
    if let Some(wal) = &set.wal_volume_claim_spec {
        volumes.push(volume(
            cluster,
            set,
            instance_name,
            naming::instance_wal_volume(instance_name),
            naming::ROLE_POSTGRES_WAL,
            wal,
        ));
    }
    volumes
}
