//! Prometheus-style metrics and the `/metrics` HTTP endpoint.

use std::net::SocketAddr;

use axum::{extract::State, routing::get, Router};
use prometheus::{
    HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use provisioner_tokio::notify_once::NotifyOnce;
use provisioner_tokio::task::Task;
use tracing::{error, info, info_span};

/// All metrics collectors registered with one [`Registry`]. Cheap to clone;
/// every field is internally a handle into shared, thread-safe state.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// `rpc_time{site,target}` - latency of a single fabric RPC call.
    pub rpc_time: HistogramVec,
    /// `helper_time{site}` - latency of a single helper subprocess call.
    pub helper_time: HistogramVec,
    /// `discovered{site}` - identities surfaced by broadcast discovery.
    pub discovered: IntCounterVec,
    /// `event_discovered{site}` - identities surfaced by the event source.
    pub event_discovered: IntCounterVec,
    /// `discover_cycles{site}` - completed broadcast discovery cycles.
    pub discover_cycles: IntCounterVec,
    /// `rpc_errors{site,target}` - failed fabric RPC calls.
    pub rpc_errors: IntCounterVec,
    /// `helper_errors{site}` - failed helper subprocess invocations.
    pub helper_errors: IntCounterVec,
    /// `discovery_errors{site}` - broadcast discovery cycles that failed.
    pub discovery_errors: IntCounterVec,
    /// `provision_errors{site}` - attempts that terminated FAILED.
    pub provision_errors: IntCounterVec,
    /// `provisioned{site}` - attempts that terminated DONE.
    pub provisioned: IntCounterVec,
    /// `deferred{site}` - attempts that terminated DEFERRED. Not named in
    /// the original metric list but tracked the same way `provisioned` and
    /// `provision_errors` are, since a deferral is neither.
    pub deferred: IntCounterVec,
    /// `paused` gauge, 1 when the pause gate is engaged, else 0.
    pub paused: IntGauge,
    /// `busy_workers` gauge, count of workers currently draining an
    /// attempt.
    pub busy_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rpc_time = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "rpc_time",
                "latency of a single fabric RPC call, in seconds",
            ),
            &["site", "target"],
        )
        .expect("valid metric");
        let helper_time = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "helper_time",
                "latency of a single helper subprocess call, in seconds",
            ),
            &["site"],
        )
        .expect("valid metric");
        let discovered = IntCounterVec::new(
            prometheus::Opts::new(
                "discovered",
                "identities surfaced by broadcast discovery",
            ),
            &["site"],
        )
        .expect("valid metric");
        let event_discovered = IntCounterVec::new(
            prometheus::Opts::new(
                "event_discovered",
                "identities surfaced by the lifecycle/registration event source",
            ),
            &["site"],
        )
        .expect("valid metric");
        let discover_cycles = IntCounterVec::new(
            prometheus::Opts::new(
                "discover_cycles",
                "completed broadcast discovery cycles",
            ),
            &["site"],
        )
        .expect("valid metric");
        let rpc_errors = IntCounterVec::new(
            prometheus::Opts::new("rpc_errors", "failed fabric RPC calls"),
            &["site", "target"],
        )
        .expect("valid metric");
        let helper_errors = IntCounterVec::new(
            prometheus::Opts::new(
                "helper_errors",
                "failed helper subprocess invocations",
            ),
            &["site"],
        )
        .expect("valid metric");
        let discovery_errors = IntCounterVec::new(
            prometheus::Opts::new(
                "discovery_errors",
                "broadcast discovery cycles that failed",
            ),
            &["site"],
        )
        .expect("valid metric");
        let provision_errors = IntCounterVec::new(
            prometheus::Opts::new(
                "provision_errors",
                "provisioning attempts that terminated FAILED",
            ),
            &["site"],
        )
        .expect("valid metric");
        let provisioned = IntCounterVec::new(
            prometheus::Opts::new(
                "provisioned",
                "provisioning attempts that terminated DONE",
            ),
            &["site"],
        )
        .expect("valid metric");
        let deferred = IntCounterVec::new(
            prometheus::Opts::new(
                "deferred",
                "provisioning attempts that terminated DEFERRED",
            ),
            &["site"],
        )
        .expect("valid metric");
        let paused = IntGauge::new(
            "paused",
            "1 when the pause gate is engaged, else 0",
        )
        .expect("valid metric");
        let busy_workers = IntGauge::new(
            "busy_workers",
            "number of workers currently draining a provisioning attempt",
        )
        .expect("valid metric");

        for collector in [
            Box::new(rpc_time.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(helper_time.clone()),
            Box::new(discovered.clone()),
            Box::new(event_discovered.clone()),
            Box::new(discover_cycles.clone()),
            Box::new(rpc_errors.clone()),
            Box::new(helper_errors.clone()),
            Box::new(discovery_errors.clone()),
            Box::new(provision_errors.clone()),
            Box::new(provisioned.clone()),
            Box::new(deferred.clone()),
            Box::new(paused.clone()),
            Box::new(busy_workers.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric names don't collide");
        }

        Self {
            registry,
            rpc_time,
            helper_time,
            discovered,
            event_discovered,
            discover_cycles,
            rpc_errors,
            helper_errors,
            discovery_errors,
            provision_errors,
            provisioned,
            deferred,
            paused,
            busy_workers,
        }
    }

    fn encode(&self) -> String {
        let metric_families = self.registry.gather();
        TextEncoder::new()
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("failed to encode metrics: {e}");
                String::new()
            })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> String {
    metrics.encode()
}

/// Spawns the `/metrics` HTTP server if `monitor_port != 0`, returning
/// `None` otherwise - the metrics surface is optional per the config.
pub async fn spawn(
    monitor_port: u16,
    metrics: Metrics,
    shutdown: NotifyOnce,
) -> anyhow::Result<Option<Task<()>>> {
    if monitor_port == 0 {
        info!("monitor_port is 0, not starting the metrics HTTP server");
        return Ok(None);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], monitor_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind metrics listener on {addr}: {e}"))?;
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let span = info_span!("(metrics-server)");
    let task = Task::spawn_with_span("metrics-server", span, async move {
        let mut shutdown_rx = shutdown;
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        });
        if let Err(e) = server.await {
            error!("metrics server exited with an error: {e}");
        }
    });

    Ok(Some(task))
}
