use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use pgha_operator::health::{HealthState, run_health_server};
use pgha_operator::{run_controller, run_controller_scoped};

const LEASE_NAME: &str = "pgha-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to a pass that is mid-way through scaling or an upgrade step
/// to write its status before the process exits
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("no rustls crypto provider could be installed".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pgha_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let client = Client::try_default().await?;
    let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, falling back to the hostname as lease holder");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let lease_namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, holding the lease in 'default'");
        "default".to_string()
    });
    let watch_namespace = std::env::var("WATCH_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty());

    info!(
        holder_id = %holder_id,
        lease_namespace = %lease_namespace,
        scope = watch_namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting pgha-operator"
    );

    // Probes answer before leadership so standby replicas stay healthy
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lease = leader_lease(&client, &lease_namespace, &holder_id);
    acquire_leadership(&lease).await;

    // Two leaders could both scale instance sets, so losing the lease exits
    let lease_renewal_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lease.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lease taken over by another operator, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Failed to renew lease: {}, exiting", e);
                    std::process::exit(1);
                }
            }
        }
    });

    let controller_handle = {
        let health_state = health_state.clone();
        let client = client.clone();
        tokio::spawn(async move {
            match watch_namespace {
                Some(ns) => run_controller_scoped(client, Some(health_state), Some(&ns)).await,
                None => run_controller(client, Some(health_state)).await,
            }
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("PostgresCluster controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Only reached on panic, the task otherwise exits the process
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, no new passes will start");
            health_state.set_ready(false).await;
            info!(
                grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "Letting the current pass write its status"
            );
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("pgha-operator stopped");
    Ok(())
}

fn leader_lease(client: &Client, namespace: &str, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    )
}

/// Block until this replica holds the lease
async fn acquire_leadership(lease: &LeaseLock) {
    info!(lease_name = LEASE_NAME, "Waiting for leadership before reconciling clusters");
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership, starting the PostgresCluster controller");
                return;
            }
            Ok(_) => info!("Another operator holds the lease"),
            Err(e) => warn!("Failed to acquire lease: {}, retrying", e),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
