//! Request/reply payload shapes for the node-agent RPC surface consumed by
//! the host state machine: `rpcutil#inventory`, `choria_provision#gencsr`,
//! `choria_provision#jwt`, `choria_provision#configure`,
//! `choria_provision#restart`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `rpcutil#inventory` takes no meaningful request body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InventoryRequest {}

/// `rpcutil#inventory`'s reply is an opaque facts/classes/agents/collectives
/// blob; the orchestrator never interprets it, only forwards it to the
/// helper.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryReply(pub Value);

/// `choria_provision#gencsr` request.
#[derive(Debug, Clone, Serialize)]
pub struct GenCsrRequest {
    pub cn: String,
}

/// `choria_provision#gencsr` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct GenCsrReply {
    pub csr: String,
    pub ssldir: String,
}

/// `choria_provision#jwt` request; the token, if configured, authorizes the
/// call the same way as every other privileged action.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JwtRequest {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub token: String,
}

/// `choria_provision#jwt` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtReply {
    pub jwt: String,
}

/// `choria_provision#configure` request.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigureRequest {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub token: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ca: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub certificate: String,
    /// JSON-encoded string of the final `{String: String}` configuration.
    pub configuration: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub ssldir: String,
}

/// `choria_provision#restart` request. `splay` is a small random delay (in
/// seconds) before the node restarts, to avoid a thundering herd of nodes
/// leaving the provisioning subcollective at once.
#[derive(Debug, Clone, Serialize)]
pub struct RestartRequest {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub token: String,
    pub splay: u32,
}
