//! Wires every long-lived routine together under one shutdown signal: the
//! discovery loop, the event loop, the metrics HTTP server, and the worker
//! pool draining the work queue.

use std::sync::Arc;
use std::time::Duration;

use provisioner_proto::Config;
use provisioner_tokio::notify_once::NotifyOnce;
use provisioner_tokio::task::{self, Task};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::fabric::{FabricClient, NatsFabricClient};
use crate::helper_invoker::HelperInvoker;
use crate::metrics::{self, Metrics};
use crate::pause::PauseGate;
use crate::queue::{self, WorkQueueReceiver};
use crate::state_machine::{AttemptOutcome, HostStateMachine};
use crate::{discovery, events};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const LIFECYCLE_COMPONENT_FIELD: &str = "provisioner";

/// Starts every long-lived task and blocks until shutdown completes (either
/// a clean `SIGINT`/`SIGTERM` or one of the static tasks finishing
/// prematurely).
pub async fn run(config: Config, nats_url: &str) -> anyhow::Result<()> {
    let nc = async_nats::connect(nats_url).await?;
    let metrics = Metrics::new();
    let pause = PauseGate::new(false).with_gauge(metrics.paused.clone());
    let shutdown = NotifyOnce::new();

    let fabric: Arc<dyn FabricClient> = Arc::new(NatsFabricClient::new(
        nc.clone(),
        config.site.clone(),
        metrics.clone(),
        pause.clone(),
        shutdown.clone(),
    ));
    let helper = Arc::new(HelperInvoker::new(
        config.helper.clone(),
        config.site.clone(),
        metrics.clone(),
    ));
    let state_machine = Arc::new(HostStateMachine::new(
        fabric.clone(),
        helper,
        metrics.clone(),
        config.site.clone(),
        config.token.clone(),
        config.features.pki,
        config.cert_deny_list.clone(),
        shutdown.clone(),
    ));

    let (queue, queue_rx) = queue::channel(config.workers);

    emit_lifecycle_event(&nc, config.site.clone(), "startup").await;

    let mut static_tasks = Vec::new();

    static_tasks.push(Task::spawn("discovery-loop", {
        let fabric = fabric.clone();
        let queue = queue.clone();
        let metrics = metrics.clone();
        let pause = pause.clone();
        let site = config.site.clone();
        let interval = config.interval;
        let shutdown = shutdown.clone();
        async move {
            discovery::run(fabric, queue, metrics, pause, site, interval, shutdown).await;
        }
    }));

    static_tasks.push(Task::spawn("event-loop", {
        let nc = nc.clone();
        let queue = queue.clone();
        let metrics = metrics.clone();
        let pause = pause.clone();
        let site = config.site.clone();
        let lifecycle_component = config.lifecycle_component.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) =
                events::run(nc, queue, metrics, pause, site, lifecycle_component, shutdown).await
            {
                error!("event loop exited with an error: {e:#}");
            }
        }
    }));

    if let Some(metrics_task) = metrics::spawn(config.monitor_port, metrics.clone(), shutdown.clone())
        .await?
    {
        static_tasks.push(metrics_task);
    }

    static_tasks.push(spawn_worker_pool(
        config.workers,
        state_machine,
        queue_rx,
        metrics.clone(),
        pause.clone(),
        shutdown.clone(),
    ));

    static_tasks.push(Task::spawn("shutdown-signal", {
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.send();
        }
    }));

    let (_eph_tx, eph_rx) = mpsc::channel(1);
    let result =
        task::try_join_tasks_and_shutdown(static_tasks, eph_rx, shutdown, SHUTDOWN_TIMEOUT).await;

    emit_lifecycle_event(&nc, config.site.clone(), "shutdown").await;

    result.map_err(|e| anyhow::anyhow!("orchestrator shutdown with an error: {e}"))
}

fn spawn_worker_pool(
    workers: usize,
    state_machine: Arc<HostStateMachine>,
    queue_rx: WorkQueueReceiver,
    metrics: Metrics,
    pause: PauseGate,
    shutdown: NotifyOnce,
) -> Task<()> {
    Task::spawn("worker-pool", async move {
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let mut worker_tasks = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let queue_rx = queue_rx.clone();
            let state_machine = state_machine.clone();
            let metrics = metrics.clone();
            let pause = pause.clone();
            let mut shutdown = shutdown.clone();

            worker_tasks.push(Task::spawn(
                format!("worker-{worker_id}"),
                async move {
                    loop {
                        while pause.is_paused() {
                            tokio::select! {
                                biased;
                                () = shutdown.recv() => return,
                                () = tokio::time::sleep(Duration::from_millis(250)) => {},
                            }
                        }

                        let next = {
                            let mut queue_rx = queue_rx.lock().await;
                            tokio::select! {
                                biased;
                                () = shutdown.recv() => None,
                                item = queue_rx.recv() => item,
                            }
                        };
                        let Some((identity, _guard)) = next else { break };

                        metrics.busy_workers.inc();
                        // `HostStateMachine::run` already logs and counts
                        // its own outcome; the worker just needs to free up
                        // for the next item.
                        let _: AttemptOutcome = state_machine.run(identity).await;
                        metrics.busy_workers.dec();
                    }
                },
            ));
        }

        for task in worker_tasks {
            if let Err(e) = task.await {
                warn!("worker task join error: {e}");
            }
        }
    })
}

async fn emit_lifecycle_event(nc: &async_nats::Client, site: String, event_type: &str) {
    let payload = serde_json::json!({
        "type": event_type,
        "component": LIFECYCLE_COMPONENT_FIELD,
        "site": site,
    });
    let Ok(bytes) = serde_json::to_vec(&payload) else {
        return;
    };
    if let Err(e) = nc.publish("choria.lifecycle.provisioner", bytes.into()).await {
        warn!("failed to emit {event_type} lifecycle event: {e}");
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
