//! Expiration sweep scheduler.
//!
//! Every `interval` runs one expiration pass, then retries teardowns left
//! stuck by earlier failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use chaldeploy_lifecycle::InstanceManager;

pub async fn run_sweeper(
    manager: Arc<InstanceManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "expiration sweeper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = manager.sweep_expired().await {
                    warn!(error = %e, "expiration sweep incomplete, retrying next interval");
                }
                let resolved = manager.reconcile_stuck().await;
                if resolved > 0 {
                    info!(resolved, "stuck teardowns resolved");
                }
            }
            _ = shutdown.changed() => {
                info!("expiration sweeper shutting down");
                break;
            }
        }
    }
}
