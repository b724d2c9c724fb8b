use std::{
    borrow::Cow,
    fmt::{self, Display},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn, Instrument};

use crate::notify_once::NotifyOnce;

/// Errors that can occur while joining a set of [`Task`]s at shutdown.
#[derive(Debug, Error)]
pub enum Error {
    #[error("static task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// Structured task/shutdown helper for the orchestrator's long-lived
/// routines (discovery loop, event loop, metrics server, worker pool).
///
/// - "static" tasks run for the program's lifetime; if one finishes early,
///   this triggers a shutdown of everything else so the failure isn't silent.
/// - "ephemeral" tasks (sent over `eph_tasks_rx`) are expected to finish on
///   their own and don't trigger a shutdown when they do.
/// - After a shutdown signal, waits for all remaining tasks up to
///   `shutdown_timeout`, then reports any that hung.
pub async fn try_join_tasks_and_shutdown(
    static_tasks: Vec<Task<()>>,
    mut eph_tasks_rx: mpsc::Receiver<Task<()>>,
    mut shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    if static_tasks.is_empty() {
        shutdown.recv().await;
        return Ok(());
    }

    let mut static_tasks = static_tasks
        .into_iter()
        .map(Task::logged)
        .collect::<FuturesUnordered<_>>();
    let mut ephemeral_tasks = FuturesUnordered::new();

    let mut result = Ok(());

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            Some(task) = eph_tasks_rx.recv() => {
                debug!("Received ephemeral task: {name}", name = task.name());
                ephemeral_tasks.push(task.logged());
            }
            Some(name) = ephemeral_tasks.next() => {
                debug!("Ephemeral task finished: {name}");
            }
            Some(name) = static_tasks.next() => {
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
        }
    }

    let mut all_tasks = static_tasks
        .into_iter()
        .chain(ephemeral_tasks)
        .collect::<FuturesUnordered<_>>();

    let shutdown_timeout_fut = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(shutdown_timeout_fut);

    while !all_tasks.is_empty() {
        tokio::select! {
            Some(_name) = all_tasks.next() => (),
            () = &mut shutdown_timeout_fut => {
                let hung_tasks = all_tasks
                    .iter()
                    .map(|task| task.name().to_owned())
                    .collect::<Vec<_>>();
                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    result
}

/// Calls [`try_join_tasks_and_shutdown`] and logs the outcome, useful at a
/// callsite that just needs a `Future<Output = ()> + Send + 'static`.
pub async fn join_tasks_and_shutdown(
    name: &str,
    static_tasks: Vec<Task<()>>,
    eph_tasks_rx: mpsc::Receiver<Task<()>>,
    shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) {
    let result = try_join_tasks_and_shutdown(
        static_tasks,
        eph_tasks_rx,
        shutdown,
        shutdown_timeout,
    )
    .await;

    match result {
        Ok(()) => info!("{name} tasks finished"),
        Err(e) => error!("{name} tasks errored: {e:#}"),
    }
}

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// 1. propagates panics instead of swallowing them,
/// 2. is `#[must_use]` so a spawned task is either joined or explicitly
///    [`detach`](Task::detach)'d,
/// 3. carries a name for logging.
///
/// Encourages structured concurrency: joining spawned tasks (rather than
/// detaching them) gives saner control flow, avoids orphaned background
/// tasks, and propagates panics up to whoever's awaiting the handle.
#[must_use]
pub struct Task<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

/// Wraps a [`Task`] so its result is logged when it finishes; the task's
/// output is discarded and the future resolves to its name.
pub struct LoggedTask<T>(Task<T>);

struct TaskOutputDisplay<'a> {
    name: &'a str,
    result: Result<(), &'a tokio::task::JoinError>,
}

impl<T> Task<T> {
    /// Wrap an existing [`JoinHandle`].
    pub fn from_tokio(
        handle: JoinHandle<T>,
        name: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            task: handle,
            name: name.into(),
        }
    }

    /// Spawn a named task which inherits the current tracing span.
    #[inline]
    #[allow(clippy::disallowed_methods)]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Task<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let span = tracing::Span::current();
        Self::spawn_with_span(name, span, future)
    }

    /// Spawn a named task with a custom span.
    #[inline]
    #[allow(clippy::disallowed_methods)]
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> Task<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        Self {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drops the handle, letting the task keep running in the background.
    #[inline]
    pub fn detach(self) {
        drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wraps this task so its completion is logged.
    #[inline]
    pub fn logged(self) -> LoggedTask<T> {
        LoggedTask(self)
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => {
                let name = self.name();
                tracing::error!(%name, "task join error: {join_err:#}");
                match join_err.try_into_panic() {
                    Ok(panic_reason) => {
                        error!("task '{name}' panicked", name = self.name());
                        std::panic::resume_unwind(panic_reason)
                    }
                    Err(join_err) => Err(join_err),
                }
            }
        };

        Poll::Ready(result)
    }
}

impl<T> LoggedTask<T> {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Future for LoggedTask<T> {
    type Output = Cow<'static, str>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let mut log_error = false;
            let mut log_warn = false;

            match &result {
                Ok(_) => (),
                Err(e) if e.is_cancelled() => log_warn = true,
                Err(e) if e.is_panic() => log_error = true,
                _ => log_warn = true,
            };

            let msg = TaskOutputDisplay {
                name: self.name(),
                result: result.as_ref().map(|_| ()),
            };

            if log_error {
                error!("{msg}")
            } else if log_warn {
                warn!("{msg}")
            } else {
                info!("{msg}")
            }

            self.0.name.clone()
        })
    }
}

impl Display for TaskOutputDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join_label = match &self.result {
            Ok(_) => "finished",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(e) if e.is_panic() => "panicked",
            _ => "(unknown join error)",
        };
        write!(f, "Task '{}' {join_label}", self.name)
    }
}
