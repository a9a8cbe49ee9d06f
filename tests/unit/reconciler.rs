//! Full reconciliation passes against the in-memory client

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use pgha_operator::controller::{REQUEUE_INTERVAL, reconcile_cluster};
use pgha_operator::controller::status::{condition_reasons, condition_status, condition_types};
use pgha_operator::health::HealthState;
use pgha_operator::resources::naming;

use crate::common::*;

#[tokio::test]
async fn test_new_cluster_creates_instances_and_volumes() {
    let client = FakeClient::new();
    let mut cluster = create_test_cluster("hippo", "default", "daisy", 2);

    let action = reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
    let state = client.state();
    assert_eq!(state.statefulsets.len(), 2);
    assert_eq!(state.volumes.len(), 2);
    for sts in &state.statefulsets {
        assert!(sts.name_any().starts_with("hippo-daisy-"));
        assert_eq!(sts.owner_references()[0].uid, TEST_UID);
    }
    assert_eq!(
        state.status.as_ref().and_then(|s| s.observed_generation),
        Some(1)
    );
}

#[tokio::test]
async fn test_second_pass_is_stable() {
    let client = FakeClient::new();
    let mut cluster = create_test_cluster("hippo", "default", "daisy", 2);

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();
    let first: Vec<String> = client
        .state()
        .statefulsets
        .iter()
        .map(|s| s.name_any())
        .collect();
    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    let state = client.state();
    let second: Vec<String> = state.statefulsets.iter().map(|s| s.name_any()).collect();
    assert_eq!(first, second);
    assert!(state.deleted.is_empty());
}

#[tokio::test]
async fn test_scale_down_keeps_primary_and_removes_replica_storage() {
    let client = FakeClient::new()
        .with_statefulsets(vec![
            statefulset("hippo", "daisy", "hippo-daisy-aaaa"),
            statefulset("hippo", "daisy", "hippo-daisy-bbbb"),
        ])
        .with_pods(vec![
            PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
                .replica()
                .running()
                .build(),
            PodBuilder::new("hippo", "daisy", "hippo-daisy-bbbb")
                .primary()
                .running()
                .build(),
        ])
        .with_volumes(vec![
            data_volume("hippo", "daisy", "hippo-daisy-aaaa"),
            data_volume("hippo", "daisy", "hippo-daisy-bbbb"),
        ]);
    let mut cluster = create_test_cluster("hippo", "default", "daisy", 1);

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    assert_eq!(client.deleted("StatefulSet"), vec!["hippo-daisy-aaaa"]);
    assert_eq!(
        client.deleted("PersistentVolumeClaim"),
        vec!["hippo-daisy-aaaa-pgdata"]
    );
    let state = client.state();
    assert_eq!(state.applied_statefulsets, vec!["hippo-daisy-bbbb"]);
    assert_eq!(
        state.status.as_ref().and_then(|s| s.primary_instance.clone()),
        Some("hippo-daisy-bbbb".to_string())
    );
}

#[tokio::test]
async fn test_removed_set_is_torn_down() {
    let client = FakeClient::new()
        .with_statefulsets(vec![
            statefulset("hippo", "daisy", "hippo-daisy-aaaa"),
            statefulset("hippo", "rocky", "hippo-rocky-aaaa"),
        ])
        .with_pods(vec![
            PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
                .primary()
                .running()
                .build(),
        ]);
    let mut cluster = create_test_cluster("hippo", "default", "daisy", 1);

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    assert_eq!(client.deleted("StatefulSet"), vec!["hippo-rocky-aaaa"]);
}

#[tokio::test]
async fn test_stopped_set_scales_down_extra_statefulsets() {
    let client = FakeClient::new().with_statefulsets(vec![
        statefulset("hippo", "daisy", "hippo-daisy-aaaa"),
        statefulset("hippo", "daisy", "hippo-daisy-bbbb"),
        statefulset("hippo", "daisy", "hippo-daisy-cccc"),
    ]);
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 1)
        .with_shutdown(true)
        .with_startup_instance("hippo-daisy-cccc", "daisy")
        .build();

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    // The startup instance is the one left to boot
    assert_eq!(
        client.deleted("StatefulSet"),
        vec!["hippo-daisy-aaaa", "hippo-daisy-bbbb"]
    );
    let state = client.state();
    assert_eq!(state.applied_statefulsets, vec!["hippo-daisy-cccc"]);
    assert_eq!(state.statefulsets.len(), 1);
}

#[tokio::test]
async fn test_pending_instances_beyond_replicas_are_removed() {
    let client = FakeClient::new()
        .with_statefulsets(vec![
            statefulset("hippo", "daisy", "hippo-daisy-aaaa"),
            statefulset("hippo", "daisy", "hippo-daisy-bbbb"),
            statefulset("hippo", "daisy", "hippo-daisy-cccc"),
        ])
        .with_pods(vec![
            PodBuilder::new("hippo", "daisy", "hippo-daisy-bbbb")
                .primary()
                .running()
                .build(),
        ]);
    let mut cluster = create_test_cluster("hippo", "default", "daisy", 2);

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    assert_eq!(client.deleted("StatefulSet"), vec!["hippo-daisy-cccc"]);
    let mut applied = client.state().applied_statefulsets;
    applied.sort();
    assert_eq!(applied, vec!["hippo-daisy-aaaa", "hippo-daisy-bbbb"]);
}

#[tokio::test]
async fn test_shutdown_records_startup_instance() {
    let client = FakeClient::new()
        .with_statefulsets(vec![
            statefulset("hippo", "daisy", "hippo-daisy-aaaa"),
            statefulset("hippo", "daisy", "hippo-daisy-bbbb"),
        ])
        .with_pods(vec![
            PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
                .primary()
                .running()
                .build(),
            PodBuilder::new("hippo", "daisy", "hippo-daisy-bbbb")
                .replica()
                .running()
                .build(),
        ]);
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 2)
        .with_shutdown(true)
        .build();

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    let status = client.state().status.unwrap();
    assert_eq!(status.startup_instance, "hippo-daisy-aaaa");
    assert_eq!(status.startup_instance_set, "daisy");

    // The primary keeps running until the replica is gone
    let state = client.state();
    let replicas = |name: &str| {
        state
            .statefulsets
            .iter()
            .find(|s| s.name_any() == name)
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.replicas)
    };
    assert_eq!(replicas("hippo-daisy-aaaa"), Some(1));
    assert_eq!(replicas("hippo-daisy-bbbb"), Some(0));
}

#[tokio::test]
async fn test_pending_upgrade_holds_back_instances() {
    let client = FakeClient::new();
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 1)
        .with_upgrade(15, true)
        .with_shutdown(true)
        .build();
    let health = HealthState::new();

    let action = reconcile_cluster(&mut cluster, &client, Some(&health))
        .await
        .unwrap();

    assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
    let state = client.state();
    assert_eq!(state.applied_jobs, vec![naming::pg_upgrade_job(&cluster)]);
    assert!(state.applied_statefulsets.is_empty());
    assert!(state.status.is_some());
}

#[tokio::test]
async fn test_upgrade_waits_for_running_pods() {
    let client = FakeClient::new()
        .with_statefulsets(vec![statefulset("hippo", "daisy", "hippo-daisy-aaaa")])
        .with_pods(vec![
            PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
                .primary()
                .running()
                .build(),
        ])
        .with_endpoints(vec![endpoints("hippo-ha")]);
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 1)
        .with_upgrade(15, true)
        .build();

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    let state = client.state();
    assert!(state.applied_jobs.is_empty());
    assert_eq!(state.endpoints.len(), 1);
    assert!(client.deleted("Endpoints").is_empty());

    let status = state.status.unwrap();
    let waiting = status
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::PG_UPGRADE_PROGRESSING)
        .unwrap();
    assert_eq!(waiting.status, condition_status::FALSE);
    assert_eq!(
        waiting.reason,
        condition_reasons::PG_UPGRADE_WAITING_FOR_SHUTDOWN
    );
}

#[tokio::test]
async fn test_restarted_cluster_after_upgrade_is_not_held() {
    let client = FakeClient::new()
        .with_statefulsets(vec![statefulset("hippo", "daisy", "hippo-daisy-aaaa")])
        .with_pods(vec![
            PodBuilder::new("hippo", "daisy", "hippo-daisy-aaaa")
                .primary()
                .running()
                .build(),
        ]);
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 1)
        .with_upgrade(15, true)
        .with_condition(condition(
            condition_types::PG_UPGRADE_COMPLETED,
            condition_status::TRUE,
            condition_reasons::PG_UPGRADE_COMPLETE,
        ))
        .build();

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    let status = client.state().status.unwrap();
    assert!(
        !status
            .conditions
            .iter()
            .any(|c| c.reason == condition_reasons::PG_UPGRADE_WAITING_FOR_SHUTDOWN)
    );
    assert_eq!(client.state().applied_statefulsets, vec!["hippo-daisy-aaaa"]);
}

#[tokio::test]
async fn test_upgrade_job_pod_is_not_an_instance() {
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 1)
        .with_upgrade(15, true)
        .with_shutdown(true)
        .build();
    let job_pod = Pod {
        metadata: ObjectMeta {
            name: Some("hippo-pgupgrade-x7k2p".to_string()),
            labels: Some(naming::pg_upgrade_job_labels("hippo")),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = FakeClient::new()
        .with_pods(vec![job_pod])
        .with_jobs(vec![upgrade_job(
            &naming::pg_upgrade_job(&cluster),
            naming::pg_upgrade_job_labels("hippo"),
            None,
        )]);

    reconcile_cluster(&mut cluster, &client, None).await.unwrap();

    // The running job still holds the pass back
    let state = client.state();
    assert!(state.applied_statefulsets.is_empty());
    assert!(state.deleted.is_empty());
}
