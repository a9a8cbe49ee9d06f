//! Unit tests for instance observation

use pgha_operator::controller::{Role, new_observed_instances};
use pgha_operator::resources::naming::CONTAINER_DATABASE;

use crate::common::*;

#[test]
fn test_statefulsets_and_pods_are_correlated_by_instance_label() {
    let cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 2)
        .build();
    let runners = vec![
        statefulset("hippo", "daisy", "hippo-daisy-aaaa"),
        statefulset("hippo", "daisy", "hippo-daisy-bbbb"),
    ];
    let pods = vec![
        PodBuilder::new("hippo", "daisy", "hippo-daisy-bbbb")
            .replica()
            .running()
            .build(),
    ];

    let observed = new_observed_instances(&cluster, &runners, &pods);

    assert_eq!(observed.len(), 2);
    assert_eq!(observed.pod_count(), 1);
    let first = observed.get("hippo-daisy-aaaa").unwrap();
    assert!(first.pods.is_empty());
    assert!(first.runner.is_some());
    let second = observed.get("hippo-daisy-bbbb").unwrap();
    assert_eq!(second.pods.len(), 1);
    assert_eq!(second.spec.as_ref().map(|s| s.name.as_str()), Some("daisy"));
}

#[test]
fn test_pods_without_statefulset_form_their_own_instance() {
    let cluster = create_test_cluster("hippo", "default", "daisy", 1);
    let pods = vec![PodBuilder::new("hippo", "daisy", "hippo-daisy-orphan").build()];

    let observed = new_observed_instances(&cluster, &[], &pods);

    let instance = observed.get("hippo-daisy-orphan").unwrap();
    assert!(instance.runner.is_none());
    assert!(instance.spec.is_none());
    assert_eq!(instance.set_name, "daisy");
}

#[test]
fn test_statefulset_of_removed_set_has_no_spec() {
    let cluster = create_test_cluster("hippo", "default", "daisy", 1);
    let runners = vec![statefulset("hippo", "max", "hippo-max-aaaa")];

    let observed = new_observed_instances(&cluster, &runners, &[]);

    assert!(observed.get("hippo-max-aaaa").unwrap().spec.is_none());
    assert!(observed.set_names().contains("max"));
}

#[test]
fn test_writable_pod_requires_running_writable_and_alive() {
    let cluster = create_test_cluster("hippo", "default", "daisy", 3);
    let pods = vec![
        // Writable but not running
        PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
            .primary()
            .build(),
        // Running replica
        PodBuilder::new("hippo", "daisy", "hippo-daisy-bbbb")
            .replica()
            .running()
            .build(),
        PodBuilder::new("hippo", "daisy", "hippo-daisy-cccc")
            .primary()
            .running()
            .build(),
    ];

    let observed = new_observed_instances(&cluster, &[], &pods);
    let (pod, instance) = observed.writable_pod(CONTAINER_DATABASE).unwrap();

    assert_eq!(instance.name, "hippo-daisy-cccc");
    assert_eq!(pod.metadata.name.as_deref(), Some("hippo-daisy-cccc-0"));
}

#[test]
fn test_terminating_primary_is_not_writable() {
    let cluster = create_test_cluster("hippo", "default", "daisy", 1);
    let pods = vec![
        PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
            .primary()
            .running()
            .terminating()
            .build(),
    ];

    let observed = new_observed_instances(&cluster, &[], &pods);

    assert!(observed.writable_pod(CONTAINER_DATABASE).is_none());
}

#[test]
fn test_role_label_is_used_when_annotation_is_missing() {
    let cluster = create_test_cluster("hippo", "default", "daisy", 1);
    let pods = vec![
        PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
            .with_role_label("master")
            .build(),
    ];

    let observed = new_observed_instances(&cluster, &[], &pods);
    let instance = observed.get("hippo-daisy-aaaa").unwrap();

    assert_eq!(instance.is_primary(), (true, true));
    // Writability only trusts the status annotation
    assert_eq!(instance.is_writable(), (false, false));
}

#[test]
fn test_role_spellings() {
    assert_eq!(Role::parse("master"), Role::Primary);
    assert_eq!(Role::parse("primary"), Role::Primary);
    assert_eq!(Role::parse("sync_standby"), Role::Replica);
    assert_eq!(Role::parse("standby_leader"), Role::StandbyPrimary);
    assert_eq!(Role::parse("Master"), Role::Unknown);
    assert!(!Role::parse("").is_known());
}
