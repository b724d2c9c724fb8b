use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use provisioner::error::FabricError;
use provisioner::fabric::FabricClient;
use provisioner_proto::error::{PausedError, RpcError};
use serde_json::Value;

/// A [`FabricClient`] driven entirely by canned replies keyed on
/// `agent#action`, recording every call it receives for assertions.
pub struct MockFabric {
    replies: HashMap<String, Value>,
    calls: Mutex<Vec<(String, String, String)>>,
    requests: Mutex<HashMap<String, Value>>,
    paused: std::sync::atomic::AtomicBool,
    /// How many times `rpcutil#inventory` should fail with `NoReply` before
    /// succeeding - used to exercise the FETCH_INVENTORY retry policy.
    pub fail_inventory_times: std::sync::atomic::AtomicUsize,
}

impl MockFabric {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(HashMap::new()),
            paused: std::sync::atomic::AtomicBool::new(false),
            fail_inventory_times: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// The last request value seen for `agent#action`, if any.
    pub fn last_request(&self, agent: &str, action: &str) -> Option<Value> {
        self.requests.lock().unwrap().get(&format!("{agent}#{action}")).cloned()
    }

    pub fn with_reply(mut self, agent: &str, action: &str, reply: Value) -> Self {
        self.replies.insert(format!("{agent}#{action}"), reply);
        self
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, agent: &str, action: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(_, a, act)| a == agent && act == action)
            .count()
    }
}

impl Default for MockFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FabricClient for MockFabric {
    async fn call(
        &self,
        identity: &str,
        agent: &str,
        action: &str,
        request: Value,
    ) -> Result<Value, FabricError> {
        if self.paused.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FabricError::Paused(PausedError));
        }

        self.calls.lock().unwrap().push((
            identity.to_owned(),
            agent.to_owned(),
            action.to_owned(),
        ));
        self.requests
            .lock()
            .unwrap()
            .insert(format!("{agent}#{action}"), request);

        if agent == "rpcutil" && action == "inventory" {
            let remaining = self
                .fail_inventory_times
                .load(std::sync::atomic::Ordering::SeqCst);
            if remaining > 0 {
                self.fail_inventory_times
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                return Err(FabricError::Rpc(RpcError::NoReply {
                    identity: identity.to_owned(),
                    agent: agent.to_owned(),
                    action: action.to_owned(),
                }));
            }
        }

        let key = format!("{agent}#{action}");
        Ok(self.replies.get(&key).cloned().unwrap_or(serde_json::json!({})))
    }

    async fn discover(&self) -> Result<Vec<String>, FabricError> {
        Ok(Vec::new())
    }
}

/// Writes an executable shell script to a fresh temp directory that prints
/// `stdout` to its stdout and exits 0, mimicking the helper subprocess
/// contract without needing the real Choria helper binary.
pub fn write_helper_script(stdout: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("helper.sh");
    let script = format!("#!/bin/sh\ncat > /dev/null\nprintf '%s' '{stdout}'\n");
    std::fs::write(&path, script).expect("write helper script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    (dir, path)
}
