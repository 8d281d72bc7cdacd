//! Debounced lane for deferred steps.
//!
//! Each module instance with deferred steps owns one [`DeferredLane`]: a
//! tokio task that coalesces dirty signals within a debounce window and
//! hands the accumulated roots to a flush callback once the window closes,
//! or once the oldest pending signal reaches the staleness bound.
//!
//! Pending work is never dropped. A superseding signal on a non-coalescing
//! lane, or a mode switch, takes the pending work out of the lane and
//! returns it to the caller, which applies it right away.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use converge_foundation::ModuleKey;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use super::dirty::{DirtyAllReason, DirtySet};

/// Why lane work was flushed the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneReason {
    /// Later signals were merged into pending work.
    Coalesced,
    /// A pending wait was interrupted and its work replayed.
    Canceled,
    /// The staleness bound fired before the debounce window closed.
    MaxLagForced,
    /// Lanes forced off; deferred work ran inline.
    ForcedOff,
    /// Lanes forced synchronous; deferred work ran right after the commit.
    ForcedSync,
    /// Lanes disabled by policy; the flush was not prioritized.
    Disabled,
}

/// Evidence attached to one lane flush (`trace:txn-lane`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaneEvidence {
    /// Signals folded into this flush.
    pub signals: usize,
    pub coalesced: usize,
    pub canceled: usize,
    pub reasons: Vec<LaneReason>,
}

impl LaneEvidence {
    /// Evidence for work that bypassed the lane.
    pub fn bypass(reason: LaneReason) -> Self {
        let mut evidence = Self {
            signals: 1,
            ..Self::default()
        };
        evidence.note(reason);
        evidence
    }

    pub fn note(&mut self, reason: LaneReason) {
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }

    /// Fold the evidence of another flush into this one.
    pub fn absorb(&mut self, other: LaneEvidence) {
        self.signals += other.signals;
        self.coalesced += other.coalesced;
        self.canceled += other.canceled;
        for reason in other.reasons {
            self.note(reason);
        }
    }
}

/// Debounce window and staleness bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneTiming {
    pub debounce: Duration,
    pub max_lag: Duration,
}

impl From<(Duration, Duration)> for LaneTiming {
    fn from((debounce, max_lag): (Duration, Duration)) -> Self {
        Self { debounce, max_lag }
    }
}

/// Lane behavior resolved from policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneSettings {
    pub timing: LaneTiming,
    pub allow_coalesce: bool,
    /// Pending roots beyond this collapse into a dirty-all.
    pub capacity: usize,
}

/// Work handed out of the lane.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredFlush {
    pub key: ModuleKey,
    pub dirty: DirtySet,
    pub evidence: LaneEvidence,
}

/// Receives flushes from the lane task.
pub type FlushFn = Arc<dyn Fn(DeferredFlush) + Send + Sync>;

#[derive(Debug)]
struct Pending {
    dirty: DirtySet,
    first_at: Instant,
    last_at: Instant,
    evidence: LaneEvidence,
}

impl Pending {
    fn deadline(&self, timing: LaneTiming) -> Instant {
        (self.last_at + timing.debounce).min(self.first_at + timing.max_lag)
    }
}

#[derive(Debug)]
struct LaneState {
    settings: LaneSettings,
    pending: Option<Pending>,
    closed: bool,
}

#[derive(Debug)]
struct LaneShared {
    state: Mutex<LaneState>,
    notify: Notify,
}

impl LaneShared {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the lane task of one module instance.
pub struct DeferredLane {
    key: ModuleKey,
    shared: Arc<LaneShared>,
    task: JoinHandle<()>,
}

impl fmt::Debug for DeferredLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredLane")
            .field("key", &self.key)
            .field("pending", &self.has_pending())
            .finish_non_exhaustive()
    }
}

impl DeferredLane {
    /// Spawn the lane task on `handle`.
    pub fn spawn(handle: &Handle, key: ModuleKey, settings: LaneSettings, flush: FlushFn) -> Self {
        let shared = Arc::new(LaneShared {
            state: Mutex::new(LaneState {
                settings,
                pending: None,
                closed: false,
            }),
            notify: Notify::new(),
        });
        let task = handle.spawn(run_lane(key.clone(), shared.clone(), flush));
        debug!(module = %key, ?settings, "deferred lane started");
        Self { key, shared, task }
    }

    /// Queue dirty roots for the deferred steps.
    ///
    /// Restarts the debounce window. On a non-coalescing lane the work
    /// already pending is returned instead of merged; the caller must apply
    /// it immediately.
    pub fn signal(&self, dirty: &DirtySet) -> Option<DeferredFlush> {
        let now = Instant::now();
        let mut state = self.shared.lock();
        let settings = state.settings;
        let mut superseded = None;

        if let Some(pending) = state.pending.as_mut().filter(|_| settings.allow_coalesce) {
            pending.dirty.union(dirty);
            pending.last_at = now;
            pending.evidence.signals += 1;
            pending.evidence.coalesced += 1;
            pending.evidence.note(LaneReason::Coalesced);
        } else {
            if let Some(mut old) = state.pending.take() {
                old.evidence.canceled += 1;
                old.evidence.note(LaneReason::Canceled);
                superseded = Some(DeferredFlush {
                    key: self.key.clone(),
                    dirty: old.dirty,
                    evidence: old.evidence,
                });
            }
            state.pending = Some(Pending {
                dirty: dirty.clone(),
                first_at: now,
                last_at: now,
                evidence: LaneEvidence {
                    signals: 1,
                    ..LaneEvidence::default()
                },
            });
        }

        if let Some(pending) = state.pending.as_mut() {
            if pending.dirty.len() > settings.capacity {
                pending.dirty.mark_all(DirtyAllReason::FallbackPolicy);
            }
            trace!(module = %self.key, signals = pending.evidence.signals, "lane signal");
        }
        drop(state);

        self.shared.notify.notify_one();
        superseded
    }

    /// Replace timing and coalescing settings; pending work keeps its
    /// timestamps and is rescheduled under the new window.
    pub fn reconfigure(&self, settings: LaneSettings) {
        self.shared.lock().settings = settings;
        self.shared.notify.notify_one();
    }

    /// Interrupt the pending wait and take its work out of the lane.
    pub fn cancel(&self, reason: LaneReason) -> Option<DeferredFlush> {
        let pending = self.shared.lock().pending.take()?;
        self.shared.notify.notify_one();
        let mut evidence = pending.evidence;
        evidence.canceled += 1;
        evidence.note(LaneReason::Canceled);
        evidence.note(reason);
        debug!(module = %self.key, ?reason, "lane wait canceled");
        Some(DeferredFlush {
            key: self.key.clone(),
            dirty: pending.dirty,
            evidence,
        })
    }

    pub fn has_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    pub fn settings(&self) -> LaneSettings {
        self.shared.lock().settings
    }
}

impl Drop for DeferredLane {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
        self.task.abort();
    }
}

async fn run_lane(key: ModuleKey, shared: Arc<LaneShared>, flush: FlushFn) {
    loop {
        let deadline = {
            let state = shared.lock();
            if state.closed {
                break;
            }
            state
                .pending
                .as_ref()
                .map(|p| p.deadline(state.settings.timing))
        };

        let Some(deadline) = deadline else {
            shared.notify.notified().await;
            continue;
        };

        tokio::select! {
            () = shared.notify.notified() => {}
            () = time::sleep_until(deadline) => {
                let ready = {
                    let mut state = shared.lock();
                    let timing = state.settings.timing;
                    match state.pending.as_ref() {
                        Some(p) if Instant::now() >= p.deadline(timing) => {
                            let forced = p.first_at + timing.max_lag < p.last_at + timing.debounce;
                            state.pending.take().map(|p| (p, forced))
                        }
                        _ => None,
                    }
                };
                if let Some((pending, forced)) = ready {
                    let mut evidence = pending.evidence;
                    if forced {
                        evidence.note(LaneReason::MaxLagForced);
                    }
                    debug!(module = %key, signals = evidence.signals, forced, "lane flush");
                    flush(DeferredFlush {
                        key: key.clone(),
                        dirty: pending.dirty,
                        evidence,
                    });
                }
            }
        }
    }
    trace!(module = %key, "deferred lane stopped");
}
