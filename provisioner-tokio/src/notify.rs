//! # `notify` channel
//!
//! Wraps [`tokio::sync::mpsc`] to provide the property that if multiple
//! notifications are sent before the receiver calls [`Receiver::recv`], the
//! receiver only wakes once, instead of once per notification.
//!
//! - `tx.send()` instead of `let _ = tx.try_send(())`: sending never blocks
//!   and never panics if the receiver was dropped.
//! - `rx.recv()` instead of `if let Some(()) = rx.recv() {}`: the future only
//!   resolves on an actual notification; if all senders are dropped it never
//!   resolves (rather than resolving once on `None`).

use tokio::sync::mpsc;

/// Create a new `notify` channel, analogous to `mpsc::channel(1)`.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = mpsc::channel(1);
    (Sender(tx), Receiver(rx))
}

/// `notify` sender, analogous to `mpsc::Sender<()>`. Cloneable.
#[derive(Clone)]
pub struct Sender(mpsc::Sender<()>);

/// `notify` receiver, analogous to `mpsc::Receiver<()>`. Not cloneable.
pub struct Receiver(mpsc::Receiver<()>);

impl Sender {
    /// Sends a notification to the [`Receiver`]. Never blocks.
    pub fn send(&self) {
        let _ = self.0.try_send(());
    }
}

impl Receiver {
    /// Waits until a notification is received. Completes immediately if one
    /// is already pending. NOTE: never completes once all [`Sender`]s drop.
    pub async fn recv(&mut self) {
        match self.0.recv().await {
            Some(()) => (),
            None => std::future::pending().await,
        }
    }

    /// Immediately returns whether a notification has been sent.
    #[must_use]
    pub fn try_recv(&mut self) -> bool {
        self.0.try_recv().is_ok()
    }

    /// Clears out any pending notifications in the channel.
    pub fn clear(&mut self) {
        while self.0.try_recv().is_ok() {}
    }
}
