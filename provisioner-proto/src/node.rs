//! The in-memory entity tracking one in-flight provisioning attempt.

use std::collections::HashMap;

use serde_json::Value;

/// A node-local PKCS#10 certificate-signing request, plus the directory on
/// the node where the matching key material lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csr {
    /// PEM-encoded certificate-signing request.
    pub csr: String,
    /// Absolute path, on the node, of its SSL directory.
    pub ssldir: String,
}

/// One in-flight provisioning attempt for a single fabric identity.
///
/// Created when a worker dequeues an identity; mutated only by its owning
/// worker; discarded when the host state machine terminates (success,
/// deferral, or fatal error).
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// Fabric-unique identity of the node being provisioned.
    pub identity: String,
    /// Shared secret sent with each privileged action. Empty means the
    /// field is omitted / sent empty; the node decides whether to enforce.
    pub token: String,
    /// Opaque inventory blob obtained from `rpcutil#inventory`.
    pub inventory: Option<Value>,
    /// Present only when `features.pki` is enabled and FETCH_CSR succeeded.
    pub csr: Option<Csr>,
    /// Raw JWT returned by the node, if it advertises JWT support.
    pub jwt: Option<String>,
    /// Final configuration to push to the node via CONFIGURE.
    pub config: HashMap<String, String>,
    pub certificate: Option<String>,
    pub ca: Option<String>,
    pub deferred: bool,
    pub defer_reason: String,
}

impl NodeRecord {
    pub fn new(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token: token.into(),
            inventory: None,
            csr: None,
            jwt: None,
            config: HashMap::new(),
            certificate: None,
            ca: None,
            deferred: false,
            defer_reason: String::new(),
        }
    }
}
