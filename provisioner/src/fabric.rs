//! The fabric client adapter: unicast request/reply against a single
//! identity on the `provisioning` subcollective, plus broadcast discovery.
//!
//! The wire protocol and transport semantics are out of scope (external
//! collaborator, per the provisioning sequence) - this module only needs
//! "publish to a subject, collect exactly one reply" and "broadcast, collect
//! replies for a window", which maps directly onto `async_nats::Client`'s
//! request/subscribe primitives.

use std::time::{Duration, Instant};

use async_nats::Client as NatsClient;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FabricError;
use crate::metrics::Metrics;
use crate::pause::PauseGate;
use provisioner_proto::error::{CancelledError, PausedError, RpcError};
use provisioner_tokio::notify_once::NotifyOnce;

/// Per-call RPC deadline. The spec calls for "default ~20s"; there's no
/// config knob for it since no caller has ever needed to change it.
const RPC_DEADLINE: Duration = Duration::from_secs(20);

/// How long a single broadcast discovery cycle waits for replies to
/// accumulate before returning what it has.
const DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

const SUBCOLLECTIVE: &str = "provisioning";

/// Object-safe so the host state machine and workers can hold
/// `Arc<dyn FabricClient>` and tests can swap in a mock. Requests and
/// replies cross this boundary as JSON [`Value`]s; callers serialize their
/// concrete request/reply types on either side with `serde_json`.
#[async_trait::async_trait]
pub trait FabricClient: Send + Sync {
    /// Sends `request` to `identity`'s `agent#action`, waits for exactly one
    /// reply, and returns its decoded JSON body. Returns [`PausedError`]
    /// (distinguished) when the pause gate is engaged instead of attempting
    /// the call.
    async fn call(
        &self,
        identity: &str,
        agent: &str,
        action: &str,
        request: Value,
    ) -> Result<Value, FabricError>;

    /// Broadcasts a discovery query against the subcollective and returns
    /// the identities that replied within the discovery window.
    async fn discover(&self) -> Result<Vec<String>, FabricError>;
}

/// [`FabricClient`] backed by a real `async-nats` connection.
#[derive(Clone)]
pub struct NatsFabricClient {
    nc: NatsClient,
    site: String,
    metrics: Metrics,
    pause: PauseGate,
    /// The root shutdown signal, doubling as the "cancelled context" of
    /// spec 1.5: a call already in flight when this fires aborts with
    /// `FabricError::Cancelled` instead of waiting out the RPC deadline.
    cancel: NotifyOnce,
}

impl NatsFabricClient {
    pub fn new(
        nc: NatsClient,
        site: String,
        metrics: Metrics,
        pause: PauseGate,
        cancel: NotifyOnce,
    ) -> Self {
        Self {
            nc,
            site,
            metrics,
            pause,
            cancel,
        }
    }

    fn subject(agent: &str, action: &str, identity: &str) -> String {
        format!("{SUBCOLLECTIVE}.{agent}.{action}.{identity}")
    }
}

#[async_trait::async_trait]
impl FabricClient for NatsFabricClient {
    async fn call(
        &self,
        identity: &str,
        agent: &str,
        action: &str,
        request: Value,
    ) -> Result<Value, FabricError> {
        if self.cancel.try_recv() {
            return Err(FabricError::Cancelled(CancelledError));
        }
        if self.pause.is_paused() {
            return Err(FabricError::Paused(PausedError));
        }

        let target = format!("{agent}#{action}");
        let subject = Self::subject(agent, action, identity);
        let payload = serde_json::to_vec(&request).map_err(|e| {
            RpcError::Transport {
                identity: identity.to_owned(),
                agent: agent.to_owned(),
                action: action.to_owned(),
                message: format!("failed to encode request: {e}"),
            }
        })?;

        let started = Instant::now();
        let mut cancel_recv = self.cancel.clone();
        let result = tokio::select! {
            biased;
            () = cancel_recv.recv() => return Err(FabricError::Cancelled(CancelledError)),
            result = tokio::time::timeout(
                RPC_DEADLINE,
                self.nc.request(subject.clone(), payload.into()),
            ) => result,
        };
        let elapsed = started.elapsed();
        self.metrics
            .rpc_time
            .with_label_values(&[&self.site, &target])
            .observe(elapsed.as_secs_f64());

        let message = match result {
            Err(_elapsed) => {
                self.metrics
                    .rpc_errors
                    .with_label_values(&[&self.site, &target])
                    .inc();
                return Err(FabricError::Rpc(RpcError::NoReply {
                    identity: identity.to_owned(),
                    agent: agent.to_owned(),
                    action: action.to_owned(),
                }));
            }
            Ok(Err(e)) => {
                self.metrics
                    .rpc_errors
                    .with_label_values(&[&self.site, &target])
                    .inc();
                return Err(FabricError::Rpc(RpcError::Transport {
                    identity: identity.to_owned(),
                    agent: agent.to_owned(),
                    action: action.to_owned(),
                    message: e.to_string(),
                }));
            }
            Ok(Ok(message)) => message,
        };

        serde_json::from_slice(&message.payload).map_err(|e| {
            self.metrics
                .rpc_errors
                .with_label_values(&[&self.site, &target])
                .inc();
            FabricError::Rpc(RpcError::Transport {
                identity: identity.to_owned(),
                agent: agent.to_owned(),
                action: action.to_owned(),
                message: format!("failed to decode reply: {e}"),
            })
        })
    }

    async fn discover(&self) -> Result<Vec<String>, FabricError> {
        if self.cancel.try_recv() {
            return Err(FabricError::Cancelled(CancelledError));
        }
        if self.pause.is_paused() {
            return Err(FabricError::Paused(PausedError));
        }

        let inbox = self.nc.new_inbox();
        let mut sub = self
            .nc
            .subscribe(inbox.clone())
            .await
            .map_err(|e| rpc_transport_err("*", "discover", e.to_string()))?;

        self.nc
            .publish_with_reply(format!("{SUBCOLLECTIVE}.discover"), inbox, Vec::new().into())
            .await
            .map_err(|e| rpc_transport_err("*", "discover", e.to_string()))?;

        let mut identities = Vec::new();
        let mut cancel_recv = self.cancel.clone();
        let deadline = tokio::time::sleep(DISCOVERY_WINDOW);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                () = cancel_recv.recv() => return Err(FabricError::Cancelled(CancelledError)),
                () = &mut deadline => break,
                maybe_msg = sub.next() => {
                    match maybe_msg {
                        Some(msg) => match std::str::from_utf8(&msg.payload) {
                            Ok(identity) => identities.push(identity.to_owned()),
                            Err(_) => warn!("discovery reply was not valid utf-8, skipping"),
                        },
                        None => break,
                    }
                }
            }
        }

        debug!(count = identities.len(), "discovery cycle complete");
        Ok(identities)
    }
}

fn rpc_transport_err(identity: &str, action: &str, message: String) -> FabricError {
    FabricError::Rpc(RpcError::Transport {
        identity: identity.to_owned(),
        agent: SUBCOLLECTIVE.to_owned(),
        action: action.to_owned(),
        message,
    })
}
