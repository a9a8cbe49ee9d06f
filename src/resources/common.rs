//! Common utilities for Kubernetes resource generation
//!
//! Shared constants plus the owner reference and label helpers every
//! generated object carries.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::PostgresCluster;
use crate::resources::naming;

/// API version for PostgresCluster CRD
pub const API_VERSION: &str = "postgres-operator.smoketurner.com/v1alpha1";

/// Kind for PostgresCluster CRD
pub const KIND: &str = "PostgresCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "postgres-operator";

/// Generate an owner reference for a PostgresCluster
///
/// This ensures that all child resources are properly owned by the cluster
/// and will be garbage collected when the cluster is deleted.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (naming::LABEL_CLUSTER.to_string(), cluster_name.to_string()),
    ])
}

/// Standard labels plus the instance set and instance keys
pub fn instance_labels(
    cluster_name: &str,
    set_name: &str,
    instance_name: &str,
) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.extend(naming::instance_labels(cluster_name, set_name, instance_name));
    labels
}
