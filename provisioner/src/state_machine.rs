//! The host state machine: drives one [`NodeRecord`] through the fixed
//! provisioning sequence.
//!
//! ```text
//! START -> FETCH_INVENTORY -> [FETCH_JWT?] -> [FETCH_CSR?] -> RUN_HELPER
//!       -> (defer? -> DEFERRED [terminal])
//!       -> CONFIGURE -> RESTART -> DONE
//!                                 (any step fails -> FAILED [terminal])
//! ```

use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde_json::json;
use tracing::{info, instrument, warn};

use provisioner_proto::error::HelperError;
use provisioner_proto::helper::{HelperCsr, HelperReply, HelperRequest};
use provisioner_proto::node::{Csr, NodeRecord};
use provisioner_proto::rpc::{
    ConfigureRequest, GenCsrReply, GenCsrRequest, InventoryReply, JwtReply, JwtRequest,
    RestartRequest,
};

use crate::error::AttemptError;
use crate::fabric::FabricClient;
use crate::helper_invoker::HelperInvoker;
use crate::metrics::Metrics;
use provisioner_tokio::notify_once::NotifyOnce;

/// Number of attempts for steps that retry "up to 5, no backoff".
const MAX_RETRIES: u32 = 5;

/// How the attempt ended. `Deferred` and `Failed` are both terminal but
/// distinct: a deferral isn't counted as a `provision_errors`.
#[derive(Debug)]
pub enum AttemptOutcome {
    Done,
    Deferred { reason: String },
    Failed(AttemptError),
}

pub struct HostStateMachine {
    fabric: Arc<dyn FabricClient>,
    helper: Arc<HelperInvoker>,
    metrics: Metrics,
    site: String,
    token: String,
    pki_enabled: bool,
    cert_deny_list: Vec<Regex>,
    /// The root shutdown signal. Checked up front (so a cancelled worker
    /// never starts a fresh attempt) and raced against the helper
    /// subprocess step, the one step in the sequence that doesn't go
    /// through `FabricClient` and so wouldn't otherwise observe it.
    shutdown: NotifyOnce,
}

impl HostStateMachine {
    pub fn new(
        fabric: Arc<dyn FabricClient>,
        helper: Arc<HelperInvoker>,
        metrics: Metrics,
        site: String,
        token: String,
        pki_enabled: bool,
        cert_deny_list: Vec<Regex>,
        shutdown: NotifyOnce,
    ) -> Self {
        Self {
            fabric,
            helper,
            metrics,
            site,
            token,
            pki_enabled,
            cert_deny_list,
            shutdown,
        }
    }

    fn is_deny_listed(&self, identity: &str) -> bool {
        self.cert_deny_list.iter().any(|re| re.is_match(identity))
    }

    /// Runs the full sequence for `identity` to completion. Never returns an
    /// `Err`: every failure mode is captured as `AttemptOutcome::Failed` so
    /// the caller (a worker) can uniformly count, log, and move on.
    #[instrument(skip(self), fields(identity = %identity))]
    pub async fn run(&self, identity: String) -> AttemptOutcome {
        let started = Instant::now();
        let mut record = NodeRecord::new(identity.clone(), self.token.clone());

        if self.is_deny_listed(&identity) {
            warn!(%identity, "identity matches cert_deny_list, refusing to provision");
            self.metrics
                .provision_errors
                .with_label_values(&[&self.site])
                .inc();
            return AttemptOutcome::Failed(AttemptError::DenyListed);
        }

        if self.shutdown.try_recv() {
            return AttemptOutcome::Failed(AttemptError::Cancelled);
        }

        let outcome = self.run_inner(&mut record).await;

        match &outcome {
            AttemptOutcome::Done => {
                self.metrics
                    .provisioned
                    .with_label_values(&[&self.site])
                    .inc();
                info!(%identity, elapsed_ms = started.elapsed().as_millis() as u64, "provisioning complete");
            }
            AttemptOutcome::Deferred { reason } => {
                self.metrics
                    .deferred
                    .with_label_values(&[&self.site])
                    .inc();
                warn!(%identity, %reason, "provisioning deferred");
            }
            AttemptOutcome::Failed(e) if e.is_cancelled() => {
                info!(%identity, "provisioning attempt cancelled");
            }
            AttemptOutcome::Failed(e) => {
                if !e.is_paused() {
                    self.metrics
                        .provision_errors
                        .with_label_values(&[&self.site])
                        .inc();
                }
                warn!(%identity, error = %e, "provisioning failed");
            }
        }

        outcome
    }

    async fn run_inner(&self, record: &mut NodeRecord) -> AttemptOutcome {
        let inventory = match self.fetch_inventory(&record.identity).await {
            Ok(inventory) => inventory,
            Err(e) => return AttemptOutcome::Failed(e),
        };
        record.inventory = Some(inventory);

        if node_advertises_jwt(record.inventory.as_ref()) {
            match self.fetch_jwt(&record.identity, &record.token).await {
                Ok(jwt) => record.jwt = Some(jwt),
                Err(e) => return AttemptOutcome::Failed(e),
            }
        }

        if self.pki_enabled {
            match self.fetch_csr(&record.identity).await {
                Ok(csr) => record.csr = Some(csr),
                Err(e) => return AttemptOutcome::Failed(e),
            }
        }

        let mut shutdown = self.shutdown.clone();
        let helper_reply = tokio::select! {
            biased;
            () = shutdown.recv() => return AttemptOutcome::Failed(AttemptError::Cancelled),
            result = self.run_helper(record) => match result {
                Ok(reply) => reply,
                Err(e) => return AttemptOutcome::Failed(AttemptError::from(e)),
            },
        };

        if helper_reply.defer {
            record.deferred = true;
            record.defer_reason = helper_reply.msg.clone();
            return AttemptOutcome::Deferred {
                reason: helper_reply.msg,
            };
        }

        record.certificate = Some(helper_reply.certificate.clone());
        record.ca = Some(helper_reply.ca.clone());
        record.config = match helper_reply.string_configuration() {
            Ok(config) => config,
            Err(key) => return AttemptOutcome::Failed(AttemptError::NonStringConfigValue(key)),
        };

        if let Err(e) = self.configure(record).await {
            return AttemptOutcome::Failed(e);
        }

        if let Err(e) = self.restart(&record.identity, &record.token).await {
            return AttemptOutcome::Failed(e);
        }

        AttemptOutcome::Done
    }

    async fn retry<F, Fut, T>(&self, max_attempts: u32, mut f: F) -> Result<T, AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::error::FabricError>>,
    {
        let mut last_err = None;
        for _attempt in 0..max_attempts {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retry_eligible = !matches!(
                        e,
                        crate::error::FabricError::Paused(_)
                            | crate::error::FabricError::Cancelled(_)
                    );
                    last_err = Some(e);
                    if !retry_eligible {
                        break;
                    }
                }
            }
        }
        Err(AttemptError::from(last_err.expect("loop runs at least once")))
    }

    async fn fetch_inventory(&self, identity: &str) -> Result<serde_json::Value, AttemptError> {
        let reply = self
            .retry(MAX_RETRIES, || {
                self.fabric
                    .call(identity, "rpcutil", "inventory", json!({}))
            })
            .await?;
        let inventory: InventoryReply =
            serde_json::from_value(reply).unwrap_or(InventoryReply(serde_json::Value::Null));
        Ok(inventory.0)
    }

    async fn fetch_jwt(&self, identity: &str, token: &str) -> Result<String, AttemptError> {
        let request = JwtRequest {
            token: token.to_owned(),
        };
        let reply = self
            .retry(MAX_RETRIES, || {
                self.fabric.call(
                    identity,
                    "choria_provision",
                    "jwt",
                    serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
                )
            })
            .await?;
        let reply: JwtReply = serde_json::from_value(reply).map_err(|e| AttemptError::Decode {
            field: "jwt".to_owned(),
            source: e.to_string(),
        })?;
        Ok(reply.jwt)
    }

    async fn fetch_csr(&self, identity: &str) -> Result<Csr, AttemptError> {
        let request = GenCsrRequest {
            cn: identity.to_owned(),
        };
        let reply = self
            .retry(1, || {
                self.fabric.call(
                    identity,
                    "choria_provision",
                    "gencsr",
                    serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
                )
            })
            .await?;
        let reply: GenCsrReply = serde_json::from_value(reply).map_err(|e| AttemptError::Decode {
            field: "csr".to_owned(),
            source: e.to_string(),
        })?;
        Ok(Csr {
            csr: reply.csr,
            ssldir: reply.ssldir,
        })
    }

    async fn run_helper(&self, record: &NodeRecord) -> Result<HelperReply, HelperError> {
        let inventory =
            serde_json::to_string(&record.inventory).map_err(|e| HelperError::Json(e.to_string()))?;
        let request = HelperRequest {
            identity: record.identity.clone(),
            csr: record.csr.clone().map(|csr| HelperCsr {
                csr: csr.csr,
                ssldir: csr.ssldir,
            }),
            inventory,
        };
        self.helper.invoke(&request).await
    }

    async fn configure(&self, record: &NodeRecord) -> Result<(), AttemptError> {
        let configuration = serde_json::to_string(&record.config)
            .expect("HashMap<String, String> always serializes to JSON");
        let request = ConfigureRequest {
            token: record.token.clone(),
            ca: record.ca.clone().unwrap_or_default(),
            certificate: record.certificate.clone().unwrap_or_default(),
            configuration,
            ssldir: record.csr.as_ref().map(|c| c.ssldir.clone()).unwrap_or_default(),
        };
        self.retry(1, || {
            self.fabric.call(
                &record.identity,
                "choria_provision",
                "configure",
                serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
            )
        })
        .await?;
        Ok(())
    }

    async fn restart(&self, identity: &str, token: &str) -> Result<(), AttemptError> {
        let request = RestartRequest {
            token: token.to_owned(),
            splay: 1,
        };
        self.retry(1, || {
            self.fabric.call(
                identity,
                "choria_provision",
                "restart",
                serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
            )
        })
        .await?;
        Ok(())
    }
}

/// Whether the node's inventory reply advertises JWT support. Inventory is
/// an opaque blob as far as the rest of the state machine is concerned, but
/// this one field has to be interpreted to decide whether FETCH_JWT runs at
/// all - mirrors how `features.pki` gates FETCH_CSR.
fn node_advertises_jwt(inventory: Option<&serde_json::Value>) -> bool {
    inventory
        .and_then(|v| v.get("agents"))
        .and_then(|agents| agents.as_array())
        .map(|agents| {
            agents
                .iter()
                .any(|a| a.as_str() == Some("choria_util") || a.as_str() == Some("choria_jwt"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::FabricError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockFabric {
        calls: StdMutex<Vec<(String, String, String)>>,
        fail_inventory_times: AtomicUsize,
    }

    impl MockFabric {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_inventory_times: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FabricClient for MockFabric {
        async fn call(
            &self,
            identity: &str,
            agent: &str,
            action: &str,
            _request: serde_json::Value,
        ) -> Result<serde_json::Value, FabricError> {
            self.calls.lock().unwrap().push((
                identity.to_owned(),
                agent.to_owned(),
                action.to_owned(),
            ));

            match (agent, action) {
                ("rpcutil", "inventory") => {
                    let remaining = self.fail_inventory_times.load(Ordering::SeqCst);
                    if remaining > 0 {
                        self.fail_inventory_times.fetch_sub(1, Ordering::SeqCst);
                        return Err(FabricError::Rpc(provisioner_proto::error::RpcError::NoReply {
                            identity: identity.to_owned(),
                            agent: agent.to_owned(),
                            action: action.to_owned(),
                        }));
                    }
                    Ok(json!({"agents": []}))
                }
                ("choria_provision", "gencsr") => Ok(json!({"csr": "PEM", "ssldir": "/ssl"})),
                ("choria_provision", "configure") => Ok(json!({})),
                ("choria_provision", "restart") => Ok(json!({})),
                _ => Ok(json!({})),
            }
        }

        async fn discover(&self) -> Result<Vec<String>, FabricError> {
            Ok(Vec::new())
        }
    }

    fn machine(fabric: Arc<MockFabric>, deny_list: Vec<Regex>) -> HostStateMachine {
        HostStateMachine::new(
            fabric,
            Arc::new(HelperInvoker::new("/bin/true".to_owned(), "dc1".to_owned(), Metrics::new())),
            Metrics::new(),
            "dc1".to_owned(),
            String::new(),
            false,
            deny_list,
            NotifyOnce::new(),
        )
    }

    #[tokio::test]
    async fn deny_listed_identity_fails_without_any_rpc() {
        let fabric = Arc::new(MockFabric::new());
        let deny_list = vec![Regex::new(r"^admin\.").unwrap()];
        let sm = machine(fabric.clone(), deny_list);

        let outcome = sm.run("admin.host1".to_owned()).await;
        assert!(matches!(outcome, AttemptOutcome::Failed(AttemptError::DenyListed)));
        assert!(fabric.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn helper_true_produces_empty_stdout_and_fails_json_parse() {
        let fabric = Arc::new(MockFabric::new());
        let sm = machine(fabric, Vec::new());

        let outcome = sm.run("n1.example".to_owned()).await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed(AttemptError::Helper(HelperError::Json(_)))
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_a_not_yet_started_attempt() {
        let fabric = Arc::new(MockFabric::new());
        let shutdown = NotifyOnce::new();
        shutdown.send();
        let sm = HostStateMachine::new(
            fabric.clone(),
            Arc::new(HelperInvoker::new("/bin/true".to_owned(), "dc1".to_owned(), Metrics::new())),
            Metrics::new(),
            "dc1".to_owned(),
            String::new(),
            false,
            Vec::new(),
            shutdown,
        );

        let outcome = sm.run("n1.example".to_owned()).await;
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed(AttemptError::Cancelled)
        ));
        assert!(fabric.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inventory_retries_and_eventually_succeeds() {
        let fabric = Arc::new(MockFabric::new());
        fabric.fail_inventory_times.store(2, Ordering::SeqCst);
        let sm = machine(fabric.clone(), Vec::new());

        let _outcome = sm.run("n1.example".to_owned()).await;
        let calls = fabric.calls.lock().unwrap();
        let inventory_calls = calls
            .iter()
            .filter(|(_, agent, action)| agent == "rpcutil" && action == "inventory")
            .count();
        assert_eq!(inventory_calls, 3);
    }
}
