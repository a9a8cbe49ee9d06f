//! Status and conditions management for PostgresCluster resources
//!
//! Conditions are kept in the cluster's status block and updated in place
//! during a pass; the reconciler writes the result back once at the end.

use chrono::Utc;

use crate::crd::{Condition, PostgresCluster, PostgresClusterStatus};

/// Condition types owned by the controller
pub mod condition_types {
    /// Result of the most recent pg_upgrade Job
    pub const PG_UPGRADE_COMPLETED: &str = "PGUpgradeCompleted";
    /// A major version upgrade is underway
    pub const PG_UPGRADE_PROGRESSING: &str = "PGUpgradeProgressing";
    /// The data directory has been initialized for the running version
    pub const POSTGRES_DATA_INITIALIZED: &str = "PostgresDataInitialized";
}

/// Condition reasons set by the upgrade orchestration
pub mod condition_reasons {
    pub const PG_UPGRADE_COMPLETE: &str = "PGUpgradeComplete";
    pub const PG_UPGRADE_FAILED: &str = "PGUpgradeFailed";
    pub const PG_UPGRADE_REQUESTED: &str = "PGUpgradeRequested";
    pub const PG_UPGRADE_READY_FOR_UPGRADE: &str = "PGUpgradeReadyForUpgrade";
    pub const PG_UPGRADE_WAITING_FOR_SHUTDOWN: &str = "PGUpgradeWaitingForShutdown";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    ///
    /// The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn remove_condition(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Status block of the cluster, defaulted when the object has none yet
pub fn status_mut(cluster: &mut PostgresCluster) -> &mut PostgresClusterStatus {
    cluster.status.get_or_insert_with(Default::default)
}

/// Set a condition on the cluster's status
pub fn set_condition(
    cluster: &mut PostgresCluster,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let generation = cluster.metadata.generation;
    let status_block = status_mut(cluster);
    let existing = std::mem::take(&mut status_block.conditions);
    status_block.conditions = ConditionBuilder::from_existing(existing, generation)
        .set_condition(type_, status, reason, message)
        .build();
}

/// Remove a condition from the cluster's status if present
pub fn remove_condition(cluster: &mut PostgresCluster, type_: &str) {
    if let Some(status) = cluster.status.as_mut() {
        let existing = std::mem::take(&mut status.conditions);
        status.conditions = ConditionBuilder::from_existing(existing, None)
            .remove_condition(type_)
            .build();
    }
}

pub fn find_condition<'a>(cluster: &'a PostgresCluster, type_: &str) -> Option<&'a Condition> {
    cluster
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
}

pub fn is_condition_true(cluster: &PostgresCluster, type_: &str) -> bool {
    find_condition(cluster, type_).is_some_and(|c| c.status == condition_status::TRUE)
}

/// Check if the cluster spec has changed by comparing observed generation
pub fn spec_changed(cluster: &PostgresCluster) -> bool {
    let current_generation = cluster.metadata.generation;
    let observed_generation = cluster.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    }
}
