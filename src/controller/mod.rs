pub mod client;
pub mod context;
pub mod error;
pub mod instance;
pub mod reconciler;
pub mod role;
pub mod scaling;
pub mod status;
pub mod upgrade;

pub use client::{ClusterClient, KubeClusterClient};
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use instance::{Instance, ObservedInstances, new_observed_instances};
pub use reconciler::{REQUEUE_INTERVAL, error_policy, reconcile, reconcile_cluster};
pub use role::Role;
pub use scaling::{find_available_instance_names, instance_replicas, plan_instance_set, pods_to_keep};
pub use status::{ConditionBuilder, spec_changed};
pub use upgrade::{
    UpgradeEnvironment, UpgradePhase, observe_upgrade_env, prepare_for_upgrade,
    reconcile_upgrade_job,
};
