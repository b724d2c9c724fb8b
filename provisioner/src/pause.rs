//! The pause gate: a single lockless flag checked before every outbound
//! action. Driven by the management backplane, out of scope here beyond its
//! `paused()` read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prometheus::IntGauge;

/// Cheap to clone, cheap to read. Every outbound RPC, discovery cycle, and
/// event acceptance consults this before doing anything. Carries the
/// `paused` gauge so flipping the gate also keeps the metrics surface
/// truthful, instead of leaving `paused` a permanent 0.
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    paused: Arc<AtomicBool>,
    gauge: Option<IntGauge>,
}

impl PauseGate {
    pub fn new(paused: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(paused)),
            gauge: None,
        }
    }

    /// Attaches the `paused` gauge, syncing it to the gate's current state.
    /// Kept separate from `new` so tests can build a gate without a
    /// [`crate::metrics::Metrics`] instance at hand.
    pub fn with_gauge(self, gauge: IntGauge) -> Self {
        gauge.set(self.is_paused() as i64);
        Self {
            gauge: Some(gauge),
            ..self
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
        if let Some(gauge) = &self.gauge {
            gauge.set(paused as i64);
        }
    }
}
