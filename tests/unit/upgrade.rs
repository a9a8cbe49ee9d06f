//! Unit tests for major upgrade orchestration

use kube::ResourceExt;
use pgha_operator::controller::status::{
    condition_reasons, condition_status, condition_types, find_condition,
};
use pgha_operator::controller::{
    UpgradeEnvironment, UpgradePhase, new_observed_instances, observe_upgrade_env,
    reconcile_upgrade_job,
};
use pgha_operator::crd::{PostgresCluster, PostgresClusterStatus};
use pgha_operator::resources::naming;
use pgha_operator::resources::upgrade_job::UpgradeJobInputs;

use crate::common::*;

fn upgrading_cluster() -> PostgresCluster {
    PostgresClusterBuilder::new("hippo", "default")
        .with_postgres_version(16)
        .with_instance_set("daisy", 1)
        .with_upgrade(15, true)
        .with_shutdown(true)
        .build()
}

fn status_of(cluster: &mut PostgresCluster) -> &mut PostgresClusterStatus {
    cluster.status.get_or_insert_with(Default::default)
}

async fn run(client: &FakeClient, cluster: &mut PostgresCluster) -> bool {
    let observed = new_observed_instances(cluster, &[], &[]);
    let inputs = UpgradeJobInputs::for_cluster(cluster);
    reconcile_upgrade_job(client, cluster, &observed, &inputs)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_upgrade_creates_owned_job_when_ready() {
    let client = FakeClient::new();
    let mut cluster = upgrading_cluster();

    assert!(run(&client, &mut cluster).await);

    let state = client.state();
    assert_eq!(state.jobs.len(), 1);
    let job = &state.jobs[0];
    assert_eq!(job.name_any(), naming::pg_upgrade_job(&cluster));
    let owners = job.owner_references();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, TEST_UID);
    assert_eq!(owners[0].kind, "PostgresCluster");
    assert_eq!(
        job.labels().get(naming::LABEL_PG_UPGRADE).map(String::as_str),
        Some("hippo")
    );

    // The job runs against a recorded startup instance
    let status = cluster.status.as_ref().unwrap();
    assert!(status.startup_instance.starts_with("hippo-daisy-"));
    assert_eq!(status.startup_instance_set, "daisy");
}

#[tokio::test]
async fn test_disabled_upgrade_does_nothing() {
    let client = FakeClient::new();
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_instance_set("daisy", 1)
        .with_upgrade(15, false)
        .build();

    assert!(!run(&client, &mut cluster).await);
    assert!(client.state().jobs.is_empty());
}

#[tokio::test]
async fn test_endpoints_are_removed_before_job_is_created() {
    let cluster = upgrading_cluster();
    let client = FakeClient::new().with_endpoints(
        naming::patroni_endpoints(&cluster)
            .iter()
            .map(|name| endpoints(name))
            .collect(),
    );
    let mut cluster = cluster;

    assert!(run(&client, &mut cluster).await);

    let state = client.state();
    assert!(state.jobs.is_empty());
    assert!(state.endpoints.is_empty());
    assert_eq!(client.deleted("Endpoints").len(), 3);

    let progressing = find_condition(&cluster, condition_types::PG_UPGRADE_PROGRESSING).unwrap();
    assert_eq!(progressing.status, condition_status::TRUE);
    assert_eq!(
        progressing.reason,
        condition_reasons::PG_UPGRADE_READY_FOR_UPGRADE
    );

    // The next pass finds no endpoints and creates the job
    assert!(run(&client, &mut cluster).await);
    assert_eq!(client.state().jobs.len(), 1);
}

#[tokio::test]
async fn test_teardown_clears_cached_identities() {
    let cluster = upgrading_cluster();
    let client = FakeClient::new().with_endpoints(vec![endpoints(
        &naming::patroni_leader_endpoints(&cluster),
    )]);
    let mut cluster = cluster;
    {
        let status = cluster.status.get_or_insert_with(Default::default);
        status.patroni.system_identifier = "7312345678901234567".to_string();
        status.proxy.pg_bouncer.postgres_revision = "abc".to_string();
        status.monitoring.exporter_configuration = "def".to_string();
        status.conditions.push(condition(
            condition_types::POSTGRES_DATA_INITIALIZED,
            condition_status::TRUE,
            "Initialized",
        ));
    }

    assert!(run(&client, &mut cluster).await);

    let status = cluster.status.as_ref().unwrap();
    assert!(status.patroni.system_identifier.is_empty());
    assert!(status.proxy.pg_bouncer.postgres_revision.is_empty());
    assert!(status.monitoring.exporter_configuration.is_empty());
    assert!(find_condition(&cluster, condition_types::POSTGRES_DATA_INITIALIZED).is_none());
}

#[tokio::test]
async fn test_job_pass_drops_identities_when_endpoints_are_gone() {
    let client = FakeClient::new();
    let mut cluster = upgrading_cluster();
    {
        let status = status_of(&mut cluster);
        status.patroni.system_identifier = "7312345678901234567".to_string();
        status.monitoring.exporter_configuration = "def".to_string();
        status.conditions.push(condition(
            condition_types::POSTGRES_DATA_INITIALIZED,
            condition_status::TRUE,
            "Initialized",
        ));
    }

    assert!(run(&client, &mut cluster).await);

    assert_eq!(client.state().jobs.len(), 1);
    let status = cluster.status.as_ref().unwrap();
    assert!(status.patroni.system_identifier.is_empty());
    assert!(status.monitoring.exporter_configuration.is_empty());
    assert!(find_condition(&cluster, condition_types::POSTGRES_DATA_INITIALIZED).is_none());
}

#[tokio::test]
async fn test_completed_upgrade_releases_the_pass() {
    let mut cluster = upgrading_cluster();
    let client = FakeClient::new().with_jobs(vec![upgrade_job(
        &naming::pg_upgrade_job(&cluster),
        naming::pg_upgrade_job_labels("hippo"),
        Some("Complete"),
    )]);

    assert!(!run(&client, &mut cluster).await);

    let completed = find_condition(&cluster, condition_types::PG_UPGRADE_COMPLETED).unwrap();
    assert_eq!(completed.status, condition_status::TRUE);
    let progressing = find_condition(&cluster, condition_types::PG_UPGRADE_PROGRESSING).unwrap();
    assert_eq!(progressing.status, condition_status::FALSE);
    assert!(client.state().applied_jobs.is_empty());
}

#[tokio::test]
async fn test_recorded_completion_does_not_recreate_the_job() {
    let client = FakeClient::new();
    let mut cluster = PostgresClusterBuilder::new("hippo", "default")
        .with_postgres_version(16)
        .with_instance_set("daisy", 1)
        .with_upgrade(15, true)
        .with_shutdown(true)
        .with_condition(condition(
            condition_types::PG_UPGRADE_COMPLETED,
            condition_status::TRUE,
            condition_reasons::PG_UPGRADE_COMPLETE,
        ))
        .build();

    assert!(!run(&client, &mut cluster).await);

    let state = client.state();
    assert!(state.applied_jobs.is_empty());
    assert!(state.jobs.is_empty());
}

#[tokio::test]
async fn test_running_job_keeps_blocking() {
    let mut cluster = upgrading_cluster();
    let client = FakeClient::new().with_jobs(vec![upgrade_job(
        &naming::pg_upgrade_job(&cluster),
        naming::pg_upgrade_job_labels("hippo"),
        None,
    )]);

    let env = observe_upgrade_env(&client, &mut cluster).await.unwrap();
    assert_eq!(UpgradePhase::derive(&cluster, &env), UpgradePhase::Running);

    assert!(run(&client, &mut cluster).await);
    assert!(client.deleted("Job").is_empty());
}

#[tokio::test]
async fn test_failed_job_is_recorded_and_blocks() {
    let mut cluster = upgrading_cluster();
    let client = FakeClient::new().with_jobs(vec![upgrade_job(
        &naming::pg_upgrade_job(&cluster),
        naming::pg_upgrade_job_labels("hippo"),
        Some("Failed"),
    )]);

    assert!(run(&client, &mut cluster).await);

    let completed = find_condition(&cluster, condition_types::PG_UPGRADE_COMPLETED).unwrap();
    assert_eq!(completed.status, condition_status::FALSE);
    assert_eq!(completed.reason, condition_reasons::PG_UPGRADE_FAILED);
}

#[test]
fn test_phase_is_idle_without_upgrade() {
    let cluster = create_test_cluster("hippo", "default", "daisy", 1);
    let env = UpgradeEnvironment::default();

    let phase = UpgradePhase::derive(&cluster, &env);

    assert_eq!(phase, UpgradePhase::Idle);
    assert!(!phase.blocks_reconcile());
}
