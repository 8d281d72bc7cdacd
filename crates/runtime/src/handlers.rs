//! Action watchers.
//!
//! A watcher runs an async handler for every payload dispatched to one
//! action tag of one instance. Payloads travel through a bounded channel
//! sized by `lossless_backpressure_capacity`, so a dispatcher waits rather
//! than dropping work; handler tasks run on a [`JoinSet`] with at most
//! `concurrency_limit` in flight. Handlers commit state through
//! [`Runtime::run_with_state_transaction`] like any other writer.
//!
//! A failing or panicking handler is reported as
//! `diagnostic:handler-failure` and never stops its watcher. Watchers stop
//! when cancelled through their handle, which aborts the handlers in
//! flight, or when the runtime is dropped. Dropping the handle detaches the
//! watcher.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use converge_foundation::ModuleKey;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::diagnostics::{
    ConcurrencyPressureEvent, DiagnosticEvent, Diagnostics, HandlerFailureEvent,
};
use crate::error::{Error, Result, panic_message};
use crate::policy::concurrency::ResolvedConcurrencyPolicy;
use crate::runtime::{Runtime, WeakRuntime};

/// Result of one handler run; the error is a human-readable message.
pub type HandlerResult = std::result::Result<(), String>;

/// Future returned by an [`ActionHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Async handler of one action payload.
pub type ActionHandler = Arc<dyn Fn(Runtime, Value) -> HandlerFuture + Send + Sync>;

/// Counters of a finished watcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    /// Handlers aborted by cancellation.
    pub cancelled: u64,
}

#[derive(Debug)]
struct Pressure {
    backlog_since: Option<Instant>,
}

/// Sending side of a watcher's channel, shared with the runtime registry.
#[derive(Clone)]
pub(crate) struct ActionSender {
    key: ModuleKey,
    action: String,
    tx: mpsc::Sender<Value>,
    policy: ResolvedConcurrencyPolicy,
    diagnostics: Diagnostics,
    pressure: Arc<Mutex<Pressure>>,
}

impl fmt::Debug for ActionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSender")
            .field("key", &self.key)
            .field("action", &self.action)
            .field("backlog", &self.backlog())
            .finish_non_exhaustive()
    }
}

impl ActionSender {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Payloads waiting for a handler slot.
    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue a payload, waiting while the channel is full.
    pub async fn send(&self, payload: Value) -> Result<()> {
        self.check_pressure();
        self.tx.send(payload).await.map_err(|_| self.closed())
    }

    /// Queue a payload without waiting.
    pub fn try_send(&self, payload: Value) -> Result<()> {
        self.check_pressure();
        self.tx.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::Backpressure {
                key: self.key.clone(),
                action: self.action.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => self.closed(),
        })
    }

    fn closed(&self) -> Error {
        Error::WatcherClosed {
            key: self.key.clone(),
            action: self.action.clone(),
        }
    }

    fn check_pressure(&self) {
        let backlog = self.backlog();
        let now = Instant::now();
        let age = {
            let mut pressure = self.pressure.lock().unwrap_or_else(PoisonError::into_inner);
            if backlog == 0 {
                pressure.backlog_since = None;
                return;
            }
            now.saturating_duration_since(*pressure.backlog_since.get_or_insert(now))
        };

        let threshold = self.policy.pressure_warning_threshold;
        if backlog < threshold.backlog_count
            && age < Duration::from_millis(threshold.backlog_duration_ms)
        {
            return;
        }
        let key = format!("pressure:{}:{}", self.key, self.action);
        let cooldown = Duration::from_millis(self.policy.warning_cooldown_ms);
        self.diagnostics.throttled(&key, cooldown, || {
            warn!(module = %self.key, action = %self.action, backlog, "watcher under pressure");
            DiagnosticEvent::ConcurrencyPressure(ConcurrencyPressureEvent {
                module: self.key.to_string(),
                action: self.action.clone(),
                backlog,
                backlog_age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                limit: self.policy.concurrency_limit.permits(),
            })
        });
    }
}

/// Handle to a running watcher.
#[derive(Debug)]
pub struct WatcherHandle {
    sender: ActionSender,
    cancel: Arc<watch::Sender<bool>>,
    task: JoinHandle<WatcherStats>,
}

impl WatcherHandle {
    pub fn key(&self) -> &ModuleKey {
        &self.sender.key
    }

    pub fn action(&self) -> &str {
        self.sender.action()
    }

    /// Queue a payload, waiting while the channel is full.
    pub async fn dispatch(&self, payload: Value) -> Result<()> {
        self.sender.send(payload).await
    }

    /// Queue a payload; fails with [`Error::Backpressure`] when full.
    pub fn try_dispatch(&self, payload: Value) -> Result<()> {
        self.sender.try_send(payload)
    }

    pub fn backlog(&self) -> usize {
        self.sender.backlog()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.task.is_finished()
    }

    /// Interrupt the watcher: no further payloads are taken and handlers in
    /// flight are aborted.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Cancel and wait for the watcher to stop.
    pub async fn shutdown(self) -> WatcherStats {
        self.cancel();
        self.join().await
    }

    /// Wait for the watcher to stop on its own (after [`Self::cancel`], or
    /// once every sender is gone).
    pub async fn join(self) -> WatcherStats {
        let Self { sender, cancel, task } = self;
        drop(sender);
        let stats = task.await.unwrap_or_default();
        drop(cancel);
        stats
    }
}

/// Everything a watcher task needs.
pub(crate) struct WatcherSpec {
    pub key: ModuleKey,
    pub action: String,
    pub policy: ResolvedConcurrencyPolicy,
    pub diagnostics: Diagnostics,
    pub runtime: WeakRuntime,
    pub handler: ActionHandler,
}

/// Start a watcher on `handle`; returns its handle and a sender for the
/// runtime's dispatch registry.
pub(crate) fn spawn_watcher(handle: &Handle, spec: WatcherSpec) -> (WatcherHandle, ActionSender) {
    let (tx, rx) = mpsc::channel(spec.policy.lossless_backpressure_capacity.max(1));
    let cancel = Arc::new(watch::Sender::new(false));
    let sender = ActionSender {
        key: spec.key.clone(),
        action: spec.action.clone(),
        tx,
        policy: spec.policy.clone(),
        diagnostics: spec.diagnostics.clone(),
        pressure: Arc::new(Mutex::new(Pressure {
            backlog_since: None,
        })),
    };
    debug!(
        module = %spec.key,
        action = %spec.action,
        limit = ?spec.policy.concurrency_limit.permits(),
        capacity = spec.policy.lossless_backpressure_capacity,
        "watcher started"
    );
    let task = handle.spawn(run_watcher(spec, rx, cancel.clone()));
    let registry_sender = sender.clone();
    (
        WatcherHandle {
            sender,
            cancel,
            task,
        },
        registry_sender,
    )
}

async fn run_watcher(
    spec: WatcherSpec,
    mut rx: mpsc::Receiver<Value>,
    cancel: Arc<watch::Sender<bool>>,
) -> WatcherStats {
    let mut cancelled = cancel.subscribe();
    let semaphore = spec
        .policy
        .concurrency_limit
        .permits()
        .map(|n| Arc::new(Semaphore::new(n)));
    let mut tasks: JoinSet<HandlerResult> = JoinSet::new();
    let mut stats = WatcherStats::default();
    let mut interrupted = false;

    'watch: loop {
        while let Some(result) = tasks.try_join_next() {
            report(&spec, &mut stats, result);
        }

        let permit = match &semaphore {
            Some(semaphore) => tokio::select! {
                biased;
                _ = cancelled.wait_for(|c| *c) => {
                    interrupted = true;
                    break 'watch;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break 'watch,
                },
            },
            None => None,
        };

        let payload = tokio::select! {
            biased;
            _ = cancelled.wait_for(|c| *c) => {
                interrupted = true;
                break 'watch;
            }
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break 'watch,
            },
        };

        let Some(runtime) = spec.runtime.upgrade() else {
            debug!(module = %spec.key, action = %spec.action, "runtime dropped, watcher stopping");
            break;
        };
        stats.dispatched += 1;
        let handler = spec.handler.clone();
        tasks.spawn(async move {
            let _permit = permit;
            handler(runtime, payload).await
        });
    }

    if interrupted {
        tasks.abort_all();
    }
    while let Some(result) = tasks.join_next().await {
        report(&spec, &mut stats, result);
    }
    debug!(module = %spec.key, action = %spec.action, ?stats, "watcher stopped");
    stats
}

fn report(
    spec: &WatcherSpec,
    stats: &mut WatcherStats,
    result: std::result::Result<HandlerResult, JoinError>,
) {
    let (message, downgrade) = match result {
        Ok(Ok(())) => {
            stats.completed += 1;
            return;
        }
        Ok(Err(message)) => (message, None),
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            match panic_message(payload.as_ref()) {
                Some(message) => (message, None),
                None => (
                    "handler panicked".to_string(),
                    Some("panic payload was not a string".to_string()),
                ),
            }
        }
        Err(_) => {
            stats.cancelled += 1;
            return;
        }
    };

    stats.failed += 1;
    warn!(module = %spec.key, action = %spec.action, %message, "handler failed");
    spec.diagnostics
        .emit(DiagnosticEvent::HandlerFailure(HandlerFailureEvent {
            module: spec.key.to_string(),
            action: spec.action.clone(),
            message,
            downgrade,
        }));
}
