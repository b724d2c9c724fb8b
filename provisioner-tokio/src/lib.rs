//! Small utilities and extensions built on top of Tokio, used to give the
//! orchestrator's long-lived routines (discovery loop, event loop, metrics
//! server, worker pool) a single structured shutdown path.

/// A channel for sending deduplicated notifications with no data attached.
pub mod notify;
/// [`NotifyOnce`](notify_once::NotifyOnce), used as the root shutdown signal.
pub mod notify_once;
/// [`Task`] and associated helpers.
pub mod task;

// Saves a `tokio` dependency declaration at call sites.
pub use tokio;

/// Default bound used for internal broadcast/mpsc channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;
