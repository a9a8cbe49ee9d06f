//! Member role as reported by Patroni
//!
//! Patroni publishes each member's state in two places on its pod: a JSON
//! `status` annotation and the `spilo-role` label. Neither is trusted to be
//! well formed; anything that cannot be read becomes [`Role::Unknown`].

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;

use crate::resources::naming::{ANNOTATION_PATRONI_STATUS, LABEL_PATRONI_ROLE};

/// Role classification of a single cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Leader accepting read-write traffic
    Primary,
    /// Streaming replica
    Replica,
    /// Leader of a standby cluster; read-only
    StandbyPrimary,
    /// Not reported, or reported in a form we do not recognize
    Unknown,
}

impl Role {
    /// Parse a role string in any of the spellings Patroni has used
    pub fn parse(value: &str) -> Self {
        match value {
            "master" | "primary" | "leader" => Role::Primary,
            "replica" | "sync_standby" | "standby" => Role::Replica,
            "standby_leader" | "standby-leader" | "standby-primary" => Role::StandbyPrimary,
            _ => Role::Unknown,
        }
    }

    pub fn is_known(self) -> bool {
        self != Role::Unknown
    }

    pub fn is_primary(self) -> bool {
        self == Role::Primary
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
            Role::StandbyPrimary => write!(f, "standby-primary"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Deserialize)]
struct PatroniMemberStatus {
    #[serde(default)]
    role: Option<String>,
}

/// Decode the role from the raw `status` annotation value
pub fn role_from_status(status: &str) -> Role {
    match serde_json::from_str::<PatroniMemberStatus>(status) {
        Ok(PatroniMemberStatus { role: Some(role) }) => Role::parse(&role),
        _ => Role::Unknown,
    }
}

/// Role from the pod's Patroni status annotation
pub fn role_from_annotation(pod: &Pod) -> Role {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_PATRONI_STATUS))
        .map(|status| role_from_status(status))
        .unwrap_or(Role::Unknown)
}

/// Role from the pod's Patroni role label
pub fn role_from_label(pod: &Pod) -> Role {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_PATRONI_ROLE))
        .map(|role| Role::parse(role))
        .unwrap_or(Role::Unknown)
}
