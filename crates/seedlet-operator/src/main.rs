//! seedlet - agent that joins a seed cluster to the garden

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use seedlet_bootstrap::BootstrapResult;
use seedlet_cache::SyncStatus;
use seedlet_common::config::{OsEnv, SeedletConfiguration};
use seedlet_common::health::PeriodicHealth;
use seedlet_common::kube_utils::create_client;
use seedlet_common::leader_election::LeaderElector;
use seedlet_common::telemetry::{init_telemetry, TelemetryConfig};
use seedlet_common::Error;
use seedlet_operator::garden::{GardenBootstrap, GardenRunnable, SeedConfigCheck};
use seedlet_operator::probes::{self, ProbeState};
use seedlet_operator::reconcilers::IdleReconcilers;
use seedlet_operator::Lifecycle;

/// seedlet - registers a seed with the garden and keeps it healthy
#[derive(Parser, Debug)]
#[command(name = "seedlet", version, about, long_about = None)]
struct Cli {
    /// Component configuration file
    #[arg(long, env = "SEEDLET_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let config = SeedletConfiguration::load(&cli.config, &OsEnv)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    init_telemetry(TelemetryConfig::from_configuration(&config))?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = run(config, cancel).await;
    if let Err(e) = &result {
        error!(error = %e, "seedlet stopped");
    }
    result
}

async fn run(config: SeedletConfiguration, cancel: CancellationToken) -> anyhow::Result<()> {
    let seed = create_client(config.seed_client_connection.kubeconfig.as_deref())
        .await
        .context("creating seed client")?;

    let health = PeriodicHealth::new(config.health_grace());
    health.set(true);
    let sync = SyncStatus::default();

    let probes_addr: SocketAddr = format!(
        "{}:{}",
        config.server.health_probes.bind_address, config.server.health_probes.port
    )
    .parse()
    .context("parsing health probe address")?;
    let probe_state = ProbeState {
        sync: sync.clone(),
        health: health.clone(),
    };
    let listener = probes::bind(probes_addr).await?;
    let probe_cancel = cancel.clone();
    let probe_server = tokio::spawn(async move {
        let served = probes::serve(listener, probe_state, probe_cancel.clone()).await;
        if served.is_err() {
            probe_cancel.cancel();
        }
        served
    });

    let guard = if config.leader_election.leader_elect {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("seedlet-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(
            seed.clone(),
            &config.leader_election,
            &identity,
        ));

        let guard = match elector.acquire(&cancel).await {
            Ok(guard) => guard,
            Err(e) if e.is_cancelled() => return probe_outcome(probe_server).await,
            Err(e) => return Err(e.into()),
        };
        info!(%identity, "Acquired leadership");
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            let lost = tokio::select! {
                _ = guard.lost() => true,
                _ = cancel.cancelled() => false,
            };
            if lost {
                warn!("Leadership lost, shutting down");
                cancel.cancel();
            } else if let Err(e) = guard.release_leadership().await {
                warn!(error = %e, "Failed to release leadership");
            }
        }))
    } else {
        None
    };

    let bootstrap = BootstrapResult::new();
    let lifecycle = Lifecycle::new()
        .bootstrap(Arc::new(SeedConfigCheck::new(&config, seed.clone())))
        .bootstrap(Arc::new(GardenBootstrap::new(&config, seed.clone(), bootstrap.clone())))
        .main(Arc::new(GardenRunnable::new(
            config,
            seed,
            bootstrap,
            health,
            sync,
            Arc::new(IdleReconcilers),
        )));

    let outcome = lifecycle.run(cancel.clone()).await;
    cancel.cancel();

    if let Some(guard) = guard {
        join_leadership(guard).await;
    }
    let served = probe_outcome(probe_server).await;

    outcome?;
    served?;
    info!("seedlet stopped");
    Ok(())
}

/// Wait for the leadership task; returns false if it panicked
async fn join_leadership(task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Leadership task panicked");
            false
        }
    }
}

/// Wait for the probe server; its failure is the agent's failure

async fn probe_outcome(server: JoinHandle<Result<(), Error>>) -> anyhow::Result<()> {
    match server.await {
        Ok(served) => served.context("serving health probes"),
        Err(e) => {
            warn!(error = %e, "Probe server task panicked");
            Ok(())
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal");
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicked_leadership_task_is_reported() {
        assert!(join_leadership(tokio::spawn(async {})).await);
        let task = tokio::spawn(async { panic!("renewal exploded") });
        assert!(!join_leadership(task).await);
    }

    #[tokio::test]
    async fn probe_server_failure_fails_the_agent() {
        let failed = tokio::spawn(async { Err(Error::internal_with_context("probes", "closed")) });
        let err = probe_outcome(failed).await.unwrap_err();
        assert!(err.to_string().contains("serving health probes"));

        assert!(probe_outcome(tokio::spawn(async { Ok(()) })).await.is_ok());
    }
}
