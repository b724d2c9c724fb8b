//! The bit-exact JSON protocol spoken over the external helper process's
//! stdin/stdout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The CSR half of [`HelperRequest`]. Omitted entirely when the PKI feature
/// is disabled, per the wire protocol (`#[serde(skip_serializing_if)]`
/// rather than an empty object, which is the stricter but compatible
/// reading of "absent/empty object when PKI feature is disabled").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperCsr {
    pub csr: String,
    pub ssldir: String,
}

/// Serialized to the helper's stdin as a single JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperRequest {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub csr: Option<HelperCsr>,
    /// Always a *string* containing JSON - the `rpcutil#inventory` reply is
    /// JSON-encoded before being placed here, i.e. double-encoded.
    pub inventory: String,
}

/// Parsed from the helper's stdout. `configuration` values are validated to
/// all be strings by the caller; this raw form keeps arbitrary JSON values
/// so a non-string value can be reported as an error instead of silently
/// failing to deserialize.
#[derive(Debug, Clone, Deserialize)]
pub struct HelperReply {
    #[serde(default)]
    pub defer: bool,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub ca: String,
    #[serde(default)]
    pub configuration: HashMap<String, Value>,
}

impl HelperReply {
    /// Validates that every `configuration` value is a JSON string, and
    /// returns the validated string map. The first non-string value's key
    /// is returned as an error.
    pub fn string_configuration(&self) -> Result<HashMap<String, String>, String> {
        let mut out = HashMap::with_capacity(self.configuration.len());
        for (key, value) in &self.configuration {
            match value {
                Value::String(s) => {
                    out.insert(key.clone(), s.clone());
                }
                _ => return Err(key.clone()),
            }
        }
        Ok(out)
    }
}
