use std::sync::Arc;

use tokio::sync::Semaphore;

/// Synchronization utility which sends a notification to all consumers
/// *once*, used as the orchestrator's root shutdown signal.
///
/// - Multi-producer, multi-consumer: clone to get another handle.
/// - Every clone observes the signal at-most-once, even if it subscribes
///   after the signal was already sent (unlike [`tokio::sync::broadcast`]).
/// - Safe to send the signal more than once.
///
/// Implementation (ab)uses that acquiring 0 permits from a closed
/// [`Semaphore`] returns immediately with an error; closing the semaphore is
/// our "send", and observing the close error is our "recv".
#[derive(Debug)]
pub struct NotifyOnce {
    inner: Arc<Semaphore>,
    have_recved: bool,
}

impl NotifyOnce {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            have_recved: false,
        }
    }

    /// Send the shutdown signal to every waiting and future `recv` caller.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal.
    ///
    /// NOTE: if this handle has already observed the signal, this future
    /// never resolves again - clone a fresh handle if you need to `recv`
    /// more than once.
    pub async fn recv(&mut self) {
        if self.have_recved {
            std::future::pending().await
        } else {
            self.inner
                .acquire()
                .await
                .map_err(|_| ())
                .expect_err("semaphore should be closed, never have permits added");
            self.have_recved = true;
        }
    }

    /// [`Self::recv`] but taking ownership, for `'static` shutdown futures.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Returns whether the signal has been sent, without consuming it.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Clone for NotifyOnce {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            // Every clone gets its own chance to observe the signal.
            have_recved: false,
        }
    }
}
