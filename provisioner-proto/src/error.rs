//! The error taxonomy shared by every component that talks to the fabric,
//! the helper subprocess, or loads configuration.

use thiserror::Error;

/// Invalid or missing configuration at startup. Always fatal: the process
/// exits non-zero without attempting to provision anything.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A failure of a fabric call: no response, the wrong number of responses,
/// a non-OK status code, or a transport-level error. Counted per target;
/// retried per the host state machine's per-step policy.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("{identity}/{agent}#{action}: no reply received before the deadline")]
    NoReply {
        identity: String,
        agent: String,
        action: String,
    },
    #[error("{identity}/{agent}#{action}: expected exactly one reply, got {count}")]
    WrongReplyCount {
        identity: String,
        agent: String,
        action: String,
        count: usize,
    },
    #[error("{identity}/{agent}#{action}: non-OK status: {status}")]
    Status {
        identity: String,
        agent: String,
        action: String,
        status: String,
    },
    #[error("{identity}/{agent}#{action}: transport error: {message}")]
    Transport {
        identity: String,
        agent: String,
        action: String,
        message: String,
    },
}

/// Refusal to perform an outbound action because the pause gate is engaged.
/// Not counted as an [`RpcError`]; not fatal to the process.
#[derive(Debug, Clone, Copy, Error)]
#[error("refused: orchestrator is paused")]
pub struct PausedError;

/// The root or a per-attempt context was cancelled. Propagated up and
/// terminates the affected attempt or loop cleanly, without being counted
/// as a provisioning error.
#[derive(Debug, Clone, Copy, Error)]
#[error("cancelled")]
pub struct CancelledError;

/// A failure of the external helper process: it couldn't be spawned, it hit
/// the 10 second deadline, it exited non-zero, or it produced malformed or
/// ill-typed JSON.
#[derive(Debug, Error)]
pub enum HelperError {
    #[error("failed to spawn helper process: {0}")]
    Spawn(String),
    #[error("helper process did not finish within the 10 second deadline")]
    Timeout,
    #[error("helper process exited with status {0}")]
    NonZeroExit(i32),
    #[error("failed to parse helper stdin/stdout as JSON: {0}")]
    Json(String),
    #[error("helper configuration value for key {key:?} was not a string")]
    NonStringConfigValue { key: String },
}
