//! chaldeployd — the chaldeploy daemon.
//!
//! Single binary serving one challenge:
//! - Kubernetes backend (namespace / deployment / load balancer per team)
//! - Instance lifecycle manager, rebuilt from the cluster at startup
//! - Expiration sweeper
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! CHALDEPLOY_NAME="pwn me" CHALDEPLOY_IMAGE=ctf/pwn-me:latest CHALDEPLOY_PORT=31337 \
//!     chaldeployd serve --listen 0.0.0.0:5050
//! ```

mod sweeper;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use chaldeploy_core::ChallengeConfig;
use chaldeploy_lifecycle::InstanceManager;
use chaldeploy_orchestrator::{InstanceTemplate, KubeBackend, OrchestrationDriver, Poller};

#[derive(Parser)]
#[command(name = "chaldeployd", about = "Per-team challenge instance daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover running instances, then serve the API and sweep expirations.
    Serve {
        /// Address to listen on (overrides CHALDEPLOY_LISTEN).
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Expiration sweep interval in seconds (overrides CHALDEPLOY_SWEEP_INTERVAL).
        #[arg(long)]
        sweep_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,chaldeployd=debug,chaldeploy=debug")
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            listen,
            sweep_interval,
        } => {
            let mut config = ChallengeConfig::from_env().context("invalid configuration")?;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(secs) = sweep_interval {
                config.sweep_interval = Duration::from_secs(secs.max(1));
            }
            run_serve(config).await
        }
    }
}

async fn run_serve(config: ChallengeConfig) -> anyhow::Result<()> {
    info!(
        challenge = %config.challenge_name,
        image = %config.challenge_image,
        port = config.challenge_port,
        runtime_secs = config.runtime.as_secs(),
        "chaldeploy daemon starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let backend = KubeBackend::connect(config.kubeconfig_path.as_deref())
        .await
        .context("couldn't set up the kubernetes client")?;
    info!("kubernetes client initialized");

    let driver = OrchestrationDriver::new(
        Arc::new(backend),
        InstanceTemplate::from_config(&config),
        Poller::new(config.poll_initial_wait, config.poll_max_attempts),
    );
    let runtime = TimeDelta::from_std(config.runtime).context("instance runtime out of range")?;
    let manager = Arc::new(InstanceManager::new(driver, runtime));

    let recovered = manager
        .recover()
        .await
        .context("couldn't enumerate existing deployments")?;
    info!(recovered, "instance manager initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let sweeper_handle = tokio::spawn(sweeper::run_sweeper(
        manager.clone(),
        config.sweep_interval,
        shutdown_rx,
    ));

    // ── Start API server ───────────────────────────────────────

    let router = chaldeploy_api::build_router(manager);
    let addr = config.listen_addr;

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = sweeper_handle.await;

    info!("chaldeploy daemon stopped");
    Ok(())
}
