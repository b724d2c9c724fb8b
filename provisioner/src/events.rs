//! Long-lived subscription to the lifecycle/registration event topics.
//!
//! Accepts `startup` lifecycle events whose `component` matches the
//! configured `lifecycle_component`, and `provisioning` lifecycle events
//! from the node agent; drops everything else. Events arriving while the
//! pause gate is engaged are dropped, not buffered.

use std::sync::Arc;

use async_nats::Client as NatsClient;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::pause::PauseGate;
use crate::queue::WorkQueue;
use provisioner_tokio::notify_once::NotifyOnce;

const LIFECYCLE_SUBJECT: &str = "choria.lifecycle.>";
const REGISTRATION_SUBJECT: &str = "choria.registration";

#[derive(Debug, Deserialize)]
struct LifecycleEvent {
    #[serde(rename = "type")]
    event_type: String,
    component: String,
    identity: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationEvent {
    identity: String,
}

/// Subscribes to the lifecycle and registration subjects and runs until
/// `shutdown` fires. A subscribe failure is fatal to the loop - unlike a
/// single bad cycle of discovery, there's no periodic retry to fall back
/// on, so the caller's shutdown-on-premature-finish handling applies.
pub async fn run(
    nc: NatsClient,
    queue: WorkQueue,
    metrics: Metrics,
    pause: PauseGate,
    site: String,
    lifecycle_component: String,
    mut shutdown: NotifyOnce,
) -> anyhow::Result<()> {
    let mut lifecycle_sub = nc.subscribe(LIFECYCLE_SUBJECT).await?;
    let mut registration_sub = nc.subscribe(REGISTRATION_SUBJECT).await?;

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => return Ok(()),
            maybe_msg = lifecycle_sub.next() => {
                let Some(msg) = maybe_msg else { return Ok(()) };
                handle_lifecycle(&msg.payload, &queue, &metrics, &pause, &site, &lifecycle_component);
            }
            maybe_msg = registration_sub.next() => {
                let Some(msg) = maybe_msg else { return Ok(()) };
                handle_registration(&msg.payload, &queue, &metrics, &pause, &site);
            }
        }
    }
}

fn handle_lifecycle(
    payload: &[u8],
    queue: &WorkQueue,
    metrics: &Metrics,
    pause: &PauseGate,
    site: &str,
    lifecycle_component: &str,
) {
    if pause.is_paused() {
        debug!("lifecycle event dropped, orchestrator is paused");
        return;
    }

    let event: LifecycleEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("failed to parse lifecycle event: {e}");
            return;
        }
    };

    let accepted = match event.event_type.as_str() {
        "startup" => event.component == lifecycle_component,
        "provisioning" => true,
        _ => false,
    };
    if !accepted {
        return;
    }

    if let Some(identity) = event.identity {
        metrics.event_discovered.with_label_values(&[site]).inc();
        queue.enqueue(identity);
    }
}

fn handle_registration(
    payload: &[u8],
    queue: &WorkQueue,
    metrics: &Metrics,
    pause: &PauseGate,
    site: &str,
) {
    if pause.is_paused() {
        debug!("registration event dropped, orchestrator is paused");
        return;
    }

    match serde_json::from_slice::<RegistrationEvent>(payload) {
        Ok(event) => {
            metrics.event_discovered.with_label_values(&[site]).inc();
            queue.enqueue(event.identity);
        }
        Err(e) => warn!("failed to parse registration event: {e}"),
    }
}
