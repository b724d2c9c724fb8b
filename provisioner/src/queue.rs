//! Bounded work queue feeding the worker pool, with in-flight dedup: an
//! identity already queued or being worked is silently dropped rather than
//! enqueued a second time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

/// Handle used by the discovery loop and event loop to submit identities.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Handle used by workers to dequeue identities and report completion.
pub struct WorkQueueReceiver {
    rx: mpsc::Receiver<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Creates a bounded work queue with capacity `workers.max(1)`, per the
/// spec's "capacity >= workers".
pub fn channel(workers: usize) -> (WorkQueue, WorkQueueReceiver) {
    let capacity = workers.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    (
        WorkQueue {
            tx,
            in_flight: in_flight.clone(),
        },
        WorkQueueReceiver { rx, in_flight },
    )
}

impl WorkQueue {
    /// Enqueues `identity` unless it's already in flight. Never blocks: if
    /// the channel is full the enqueue is dropped, and the next discovery
    /// cycle or event re-surfaces the identity (per the spec's backpressure
    /// model).
    pub fn enqueue(&self, identity: String) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.contains(&identity) {
            trace!(%identity, "already in flight, dropping duplicate enqueue");
            return;
        }

        match self.tx.try_send(identity.clone()) {
            Ok(()) => {
                in_flight.insert(identity);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(%identity, "work queue full, dropping enqueue");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(%identity, "work queue closed, dropping enqueue");
            }
        }
    }
}

impl WorkQueueReceiver {
    /// Dequeues the next identity. Remains marked in-flight until the
    /// returned [`InFlightGuard`] is dropped, which happens when the
    /// caller's attempt terminates.
    pub async fn recv(&mut self) -> Option<(String, InFlightGuard)> {
        let identity = self.rx.recv().await?;
        Some(self.guard_for(identity))
    }

    /// Non-blocking dequeue, for tests that don't want to spin up a runtime
    /// just to observe whether an enqueue happened.
    pub fn try_recv(&mut self) -> Option<(String, InFlightGuard)> {
        let identity = self.rx.try_recv().ok()?;
        Some(self.guard_for(identity))
    }

    fn guard_for(&self, identity: String) -> (String, InFlightGuard) {
        let guard = InFlightGuard {
            identity: identity.clone(),
            in_flight: self.in_flight.clone(),
        };
        (identity, guard)
    }
}

/// Removes its identity from the in-flight set on drop, so the same
/// identity can be re-enqueued once this attempt terminates (success,
/// deferral, or failure all count as termination).
pub struct InFlightGuard {
    identity: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap().remove(&self.identity);
    }
}
