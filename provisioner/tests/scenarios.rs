//! End-to-end scenario tests driving [`HostStateMachine`] against a mock
//! fabric and a real (scripted) helper subprocess, exercising the fixed
//! provisioning sequence and its dedup/pause/worker-cap surroundings without
//! a live NATS broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use provisioner::error::AttemptError;
use provisioner::fabric::FabricClient;
use provisioner::helper_invoker::HelperInvoker;
use provisioner::metrics::Metrics;
use provisioner::queue;
use provisioner::state_machine::{AttemptOutcome, HostStateMachine};
use provisioner_tokio::notify_once::NotifyOnce;
use regex::Regex;
use serde_json::json;

use common::{write_helper_script, MockFabric};

fn machine(
    fabric: Arc<MockFabric>,
    helper_path: &str,
    site: &str,
    token: &str,
    pki_enabled: bool,
    deny_list: Vec<Regex>,
    metrics: Metrics,
) -> HostStateMachine {
    HostStateMachine::new(
        fabric,
        Arc::new(HelperInvoker::new(
            helper_path.to_owned(),
            site.to_owned(),
            metrics.clone(),
        )),
        metrics,
        site.to_owned(),
        token.to_owned(),
        pki_enabled,
        deny_list,
        NotifyOnce::new(),
    )
}

/// S1 - happy path with PKI enabled: inventory, CSR, helper, configure,
/// restart all succeed and the attempt terminates DONE.
#[tokio::test]
async fn s1_happy_path_with_pki_runs_the_full_sequence() {
    let (_dir, helper_path) = write_helper_script(
        r#"{"defer":false,"certificate":"CERT","ca":"CA","configuration":{"identity":"n1.example"}}"#,
    );

    let fabric = Arc::new(
        MockFabric::new()
            .with_reply("rpcutil", "inventory", json!({"agents": []}))
            .with_reply("choria_provision", "gencsr", json!({"csr": "PEM", "ssldir": "/opt/ssl"})),
    );
    let metrics = Metrics::new();
    let sm = machine(
        fabric.clone(),
        helper_path.to_str().unwrap(),
        "dc1",
        "t",
        true,
        Vec::new(),
        metrics.clone(),
    );

    let outcome = sm.run("n1.example".to_owned()).await;
    assert!(matches!(outcome, AttemptOutcome::Done), "{outcome:?}");

    assert_eq!(fabric.call_count("choria_provision", "gencsr"), 1);
    assert_eq!(fabric.call_count("choria_provision", "configure"), 1);
    assert_eq!(fabric.call_count("choria_provision", "restart"), 1);

    let configure_request = fabric
        .last_request("choria_provision", "configure")
        .expect("configure was called");
    assert_eq!(configure_request["token"], "t");
    assert_eq!(configure_request["ca"], "CA");
    assert_eq!(configure_request["certificate"], "CERT");
    assert_eq!(configure_request["ssldir"], "/opt/ssl");
    let configuration: serde_json::Value =
        serde_json::from_str(configure_request["configuration"].as_str().unwrap()).unwrap();
    assert_eq!(configuration["identity"], "n1.example");

    let restart_request = fabric
        .last_request("choria_provision", "restart")
        .expect("restart was called");
    assert_eq!(restart_request["splay"], 1);

    assert_eq!(metrics.provisioned.with_label_values(&["dc1"]).get(), 1);
}

/// S2 - the helper defers: no configure/restart call happens, the attempt
/// terminates DEFERRED (not FAILED), and the identity is eligible again on
/// the next cycle since nothing keeps it marked in-flight past this attempt.
#[tokio::test]
async fn s2_deferral_skips_configure_and_restart() {
    let (_dir, helper_path) =
        write_helper_script(r#"{"defer":true,"msg":"facts not ready"}"#);

    let fabric = Arc::new(
        MockFabric::new().with_reply("rpcutil", "inventory", json!({"agents": []})),
    );
    let metrics = Metrics::new();
    let sm = machine(
        fabric.clone(),
        helper_path.to_str().unwrap(),
        "dc1",
        "t",
        false,
        Vec::new(),
        metrics.clone(),
    );

    let outcome = sm.run("n2.example".to_owned()).await;
    match outcome {
        AttemptOutcome::Deferred { reason } => assert_eq!(reason, "facts not ready"),
        other => panic!("expected Deferred, got {other:?}"),
    }

    assert_eq!(fabric.call_count("choria_provision", "configure"), 0);
    assert_eq!(fabric.call_count("choria_provision", "restart"), 0);
    assert_eq!(metrics.provisioned.with_label_values(&["dc1"]).get(), 0);
    assert_eq!(metrics.deferred.with_label_values(&["dc1"]).get(), 1);
}

/// S3 - pausing mid-attempt fails the next fabric call with `PausedError`
/// and the attempt ends without incrementing `provision_errors` (a pause
/// refusal has its own `paused` gauge, it isn't a provisioning failure).
#[tokio::test]
async fn s3_pause_mid_attempt_aborts_the_remaining_sequence() {
    struct PausesAfterInventory {
        inner: MockFabric,
        paused_after_first_call: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl FabricClient for PausesAfterInventory {
        async fn call(
            &self,
            identity: &str,
            agent: &str,
            action: &str,
            request: serde_json::Value,
        ) -> Result<serde_json::Value, provisioner::error::FabricError> {
            if agent == "rpcutil" && action == "inventory" {
                self.paused_after_first_call
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                return self.inner.call(identity, agent, action, request).await;
            }
            if self
                .paused_after_first_call
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                self.inner.set_paused(true);
            }
            self.inner.call(identity, agent, action, request).await
        }

        async fn discover(&self) -> Result<Vec<String>, provisioner::error::FabricError> {
            self.inner.discover().await
        }
    }

    let fabric = Arc::new(PausesAfterInventory {
        inner: MockFabric::new().with_reply("rpcutil", "inventory", json!({"agents": []})),
        paused_after_first_call: std::sync::atomic::AtomicBool::new(false),
    });
    let (_dir, helper_path) = write_helper_script(r#"{"defer":false}"#);
    let metrics = Metrics::new();
    let sm = machine(
        fabric.clone(),
        helper_path.to_str().unwrap(),
        "dc1",
        "t",
        true,
        Vec::new(),
        metrics.clone(),
    );

    let outcome = sm.run("n3.example".to_owned()).await;
    match outcome {
        AttemptOutcome::Failed(e) => assert!(e.is_paused(), "expected a paused failure, got {e}"),
        other => panic!("expected Failed(paused), got {other:?}"),
    }
    assert_eq!(metrics.provision_errors.with_label_values(&["dc1"]).get(), 0);
}

/// S4 - an identity matching the certificate deny list is rejected before
/// any RPC is attempted, and counted as a provisioning error.
#[tokio::test]
async fn s4_deny_listed_identity_never_calls_the_fabric() {
    let fabric = Arc::new(MockFabric::new());
    let deny_list = vec![Regex::new(r"^admin\.").unwrap(), Regex::new(r"\.privileged\.").unwrap()];
    let metrics = Metrics::new();
    let sm = machine(
        fabric.clone(),
        "/bin/true",
        "dc1",
        "t",
        false,
        deny_list,
        metrics.clone(),
    );

    let outcome = sm.run("admin.privileged.choria".to_owned()).await;
    assert!(matches!(outcome, AttemptOutcome::Failed(AttemptError::DenyListed)));
    assert!(fabric.calls().is_empty());
    assert_eq!(metrics.provision_errors.with_label_values(&["dc1"]).get(), 1);
}

/// A shutdown signal fired before a worker picks up an identity aborts the
/// attempt promptly with `AttemptError::Cancelled`, without touching the
/// fabric at all - the promptness the distinguished cancellation error
/// exists for.
#[tokio::test]
async fn shutdown_cancels_an_attempt_before_it_starts() {
    let fabric = Arc::new(MockFabric::new().with_reply("rpcutil", "inventory", json!({"agents": []})));
    let (_dir, helper_path) = write_helper_script(r#"{"defer":false}"#);
    let shutdown = NotifyOnce::new();
    shutdown.send();
    let sm = HostStateMachine::new(
        fabric.clone(),
        Arc::new(HelperInvoker::new(
            helper_path.to_str().unwrap().to_owned(),
            "dc1".to_owned(),
            Metrics::new(),
        )),
        Metrics::new(),
        "dc1".to_owned(),
        "t".to_owned(),
        false,
        Vec::new(),
        shutdown,
    );

    let outcome = sm.run("n4.example".to_owned()).await;
    match outcome {
        AttemptOutcome::Failed(e) => assert!(e.is_cancelled(), "expected a cancelled failure, got {e}"),
        other => panic!("expected Failed(cancelled), got {other:?}"),
    }
    assert!(fabric.calls().is_empty());
}

/// S5 - the same identity arriving twice in quick succession (once via
/// discovery, once via the event source) only produces one queued attempt;
/// the second enqueue is a no-op while the first is still in flight.
#[tokio::test]
async fn s5_duplicate_identity_is_deduplicated_while_in_flight() {
    let (queue, mut rx) = queue::channel(4);

    queue.enqueue("dup.example".to_owned());
    queue.enqueue("dup.example".to_owned());

    let (identity, _guard) = rx.try_recv().expect("one item queued");
    assert_eq!(identity, "dup.example");
    assert!(rx.try_recv().is_none(), "second enqueue must not have queued again");
}

/// S6 - with `workers=2`, at most two attempts run concurrently; the rest
/// wait behind the bounded queue rather than all running at once.
#[tokio::test]
async fn s6_worker_cap_limits_concurrent_attempts() {
    let metrics = Metrics::new();
    let (work_queue, work_rx) = queue::channel(2);
    let gate = Arc::new(tokio::sync::Barrier::new(3));

    struct GatedFabric {
        gate: Arc<tokio::sync::Barrier>,
    }

    #[async_trait::async_trait]
    impl FabricClient for GatedFabric {
        async fn call(
            &self,
            _identity: &str,
            agent: &str,
            action: &str,
            _request: serde_json::Value,
        ) -> Result<serde_json::Value, provisioner::error::FabricError> {
            if agent == "rpcutil" && action == "inventory" {
                self.gate.wait().await;
            }
            Ok(json!({"agents": []}))
        }

        async fn discover(&self) -> Result<Vec<String>, provisioner::error::FabricError> {
            Ok(Vec::new())
        }
    }

    let fabric: Arc<dyn FabricClient> = Arc::new(GatedFabric { gate: gate.clone() });
    let (_dir, helper_path) = write_helper_script(r#"{"defer":false}"#);
    let sm = Arc::new(HostStateMachine::new(
        fabric,
        Arc::new(HelperInvoker::new(
            helper_path.to_str().unwrap().to_owned(),
            "dc1".to_owned(),
            metrics.clone(),
        )),
        metrics.clone(),
        "dc1".to_owned(),
        "t".to_owned(),
        false,
        Vec::new(),
        NotifyOnce::new(),
    ));

    for i in 0..10 {
        work_queue.enqueue(format!("n{i}.example"));
    }

    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    let mut worker_handles = Vec::new();
    for _ in 0..2 {
        let work_rx = work_rx.clone();
        let sm = sm.clone();
        worker_handles.push(tokio::spawn(async move {
            loop {
                let next = { work_rx.lock().await.try_recv() };
                let Some((identity, _guard)) = next else { break };
                let _ = sm.run(identity).await;
            }
        }));
    }

    // Both workers should be blocked inside the gated inventory call at
    // once, proving exactly `workers=2` attempts run concurrently.
    tokio::time::timeout(Duration::from_secs(5), gate.wait())
        .await
        .expect("two workers reached the gate concurrently");

    for handle in worker_handles {
        let _ = handle.await;
    }
}
