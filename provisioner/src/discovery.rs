//! Periodic broadcast discovery against the provisioning subcollective.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::fabric::FabricClient;
use crate::metrics::Metrics;
use crate::pause::PauseGate;
use crate::queue::WorkQueue;
use provisioner_tokio::notify_once::NotifyOnce;

/// Runs one immediate discovery cycle at startup, then one every `interval`,
/// until `shutdown` fires. Each cycle's errors are counted and swallowed;
/// the loop itself never exits early.
pub async fn run(
    fabric: Arc<dyn FabricClient>,
    queue: WorkQueue,
    metrics: Metrics,
    pause: PauseGate,
    site: String,
    interval: Duration,
    mut shutdown: NotifyOnce,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            _ = ticker.tick() => {
                if pause.is_paused() {
                    debug!("discovery cycle skipped, orchestrator is paused");
                    continue;
                }
                run_cycle(fabric.as_ref(), &queue, &metrics, &site).await;
            }
        }
    }
}

async fn run_cycle(fabric: &dyn FabricClient, queue: &WorkQueue, metrics: &Metrics, site: &str) {
    match fabric.discover().await {
        Ok(identities) => {
            metrics.discover_cycles.with_label_values(&[site]).inc();
            metrics
                .discovered
                .with_label_values(&[site])
                .inc_by(identities.len() as u64);
            for identity in identities {
                queue.enqueue(identity);
            }
        }
        Err(e) => {
            if !e.is_paused() {
                metrics.discovery_errors.with_label_values(&[site]).inc();
            }
            warn!("discovery cycle failed: {e}");
        }
    }
}
