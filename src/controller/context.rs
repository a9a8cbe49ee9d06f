use std::sync::Arc;

use kube::Client;

use crate::controller::client::{ClusterClient, KubeClusterClient};
use crate::health::HealthState;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Access to cluster objects
    pub client: Arc<dyn ClusterClient>,
    /// Health state for recording metrics, absent in tests
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        Self::with_client(Arc::new(KubeClusterClient::new(client)), health_state)
    }

    /// Build a context around any [`ClusterClient`]
    pub fn with_client(
        client: Arc<dyn ClusterClient>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            health_state,
        }
    }
}
