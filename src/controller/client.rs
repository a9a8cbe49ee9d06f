//! Kubernetes access used by the reconciler
//!
//! Everything the controller reads or writes goes through [`ClusterClient`]
//! so that the observation and upgrade logic can run against fakes.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::crd::{PostgresCluster, PostgresClusterStatus};
use crate::resources::common::FIELD_MANAGER;
use crate::resources::naming;

/// Trait abstracting the Kubernetes operations of a reconciliation pass
///
/// Deletes treat a missing object as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_statefulsets(&self, namespace: &str, selector: &str)
    -> Result<Vec<StatefulSet>>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>>;

    /// Fetch an Endpoints object, `None` when it does not exist
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a Job and, in the background, its pods
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete every volume labelled with the given instance
    async fn delete_volumes_for_instance(
        &self,
        namespace: &str,
        cluster_name: &str,
        instance_name: &str,
    ) -> Result<()>;

    async fn apply_job(&self, namespace: &str, job: &Job) -> Result<()>;

    async fn apply_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<()>;

    async fn apply_volume(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Replace the status subresource of a cluster
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PostgresClusterStatus,
    ) -> Result<()>;
}

/// [`ClusterClient`] backed by the API server
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list<K>(&self, namespace: &str, selector: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn delete<K>(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(name, "object already gone");
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn apply<K>(&self, namespace: &str, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_statefulsets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>> {
        self.list(namespace, selector).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        self.list(namespace, selector).await
    }

    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        self.list(namespace, selector).await
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>> {
        self.list(namespace, selector).await
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Endpoints>(namespace, name, &DeleteParams::default())
            .await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Job>(namespace, name, &DeleteParams::background())
            .await
    }

    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<StatefulSet>(namespace, name, &DeleteParams::background())
            .await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Pod>(namespace, name, &DeleteParams::default())
            .await
    }

    async fn delete_volumes_for_instance(
        &self,
        namespace: &str,
        cluster_name: &str,
        instance_name: &str,
    ) -> Result<()> {
        let selector = naming::instance_selector(cluster_name, instance_name);
        let volumes: Vec<PersistentVolumeClaim> = self.list(namespace, &selector).await?;
        for pvc in volumes {
            self.delete::<PersistentVolumeClaim>(namespace, &pvc.name_any(), &DeleteParams::default())
                .await?;
        }
        Ok(())
    }

    async fn apply_job(&self, namespace: &str, job: &Job) -> Result<()> {
        self.apply(namespace, job).await
    }

    async fn apply_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<()> {
        self.apply(namespace, sts).await
    }

    async fn apply_volume(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.apply(namespace, pvc).await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PostgresClusterStatus,
    ) -> Result<()> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
