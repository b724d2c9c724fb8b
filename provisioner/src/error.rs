//! Orchestrator-level error types that build on the shared taxonomy in
//! `provisioner_proto::error`.

use provisioner_proto::error::{CancelledError, HelperError, PausedError, RpcError};
use thiserror::Error;

/// Any failure mode of a single [`crate::fabric::FabricClient::call`].
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Paused(#[from] PausedError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl FabricError {
    /// Whether this failure is a pause-gate refusal rather than a real RPC
    /// failure. Discovery and event loops use this to skip incrementing
    /// their error counters on a pause, which has its own `paused` gauge.
    pub fn is_paused(&self) -> bool {
        matches!(self, FabricError::Paused(_))
    }
}

/// The reason a single provisioning attempt terminated in the FAILED state.
/// `Deferred` is handled as its own [`crate::state_machine::AttemptOutcome`]
/// variant, not through this error type, since a deferral is an explicit,
/// non-error outcome.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Helper(#[from] HelperError),
    #[error("attempt cancelled")]
    Cancelled,
    #[error("deny-listed identity")]
    DenyListed,
    #[error("helper returned a non-string configuration value for key {0:?}")]
    NonStringConfigValue(String),
    #[error("failed to decode {field} from the node agent's reply: {source}")]
    Decode { field: String, source: String },
}

impl AttemptError {
    /// Whether this failure originated from the pause gate rather than an
    /// actual RPC/helper failure. Callers use this to avoid double-counting
    /// `provision_errors` for a pause, which has its own `paused` gauge.
    pub fn is_paused(&self) -> bool {
        matches!(self, AttemptError::Fabric(FabricError::Paused(_)))
    }

    /// Whether this failure is a cancellation, as opposed to a "real"
    /// failure - cancellations happen on shutdown and shouldn't be logged
    /// at error level the way a genuine provisioning failure would be.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            AttemptError::Cancelled | AttemptError::Fabric(FabricError::Cancelled(_))
        )
    }
}
