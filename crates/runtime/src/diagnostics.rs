//! Structured diagnostics events and sinks.
//!
//! Diagnostics are machine-checkable payloads for tooling and tests. They are
//! separate from `tracing` logs: a [`TracingSink`] can forward them to the
//! log, a [`MemorySink`] collects them for assertions.
//!
//! Emission is gated by [`DiagnosticsLevel`]. Handler failures are the only
//! events emitted even when diagnostics are off. A sink that panics is
//! isolated; the runtime logs the panic and carries on.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::converge::DecisionSummary;
use crate::converge::deferred::LaneEvidence;
use crate::converge::DegradeReason;

/// How much the runtime reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticsLevel {
    /// Nothing but handler failures.
    #[default]
    Off,
    /// Summaries without per-step detail.
    Light,
    /// Summaries with per-step detail and hotspots.
    Full,
    /// Light, with full detail on every `sample_every_n`-th transaction.
    Sampled,
}

/// Diagnostics settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub level: DiagnosticsLevel,
    /// Sampling period for [`DiagnosticsLevel::Sampled`].
    pub sample_every_n: u64,
    /// Number of hotspot steps reported in full detail.
    pub top_k: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            level: DiagnosticsLevel::Off,
            sample_every_n: 32,
            top_k: 3,
        }
    }
}

/// Detail of a convergence report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Detail {
    None,
    Summary,
    Steps,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Tick lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TickPhase {
    Start,
    BudgetExceeded,
    Settled,
}

/// Payload of `trace:tick`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickEvent {
    pub tick_seq: u64,
    pub phase: TickPhase,
    pub max_steps: usize,
    pub urgent_step_cap: usize,
    /// Instances with queued commits (urgent, non-urgent).
    pub backlog: (usize, usize),
    pub steps: usize,
    pub stable: Option<bool>,
    pub degrade_reason: Option<DegradeReason>,
}

/// Payload of `warn:priority-inversion`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityInversionEvent {
    pub tick_seq: u64,
    /// Non-urgent instances pushed to a later tick.
    pub deferred: Vec<String>,
    pub urgent_steps: usize,
    pub max_steps: usize,
}

/// Payload of `warn:deps-mismatch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepsMismatchEvent {
    pub module: String,
    pub field: String,
    pub missing: Vec<String>,
    pub unused: Vec<String>,
}

/// Payload of `warn:schema-mismatch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaMismatchEvent {
    pub module: String,
    pub path: String,
}

/// Payload of `trace:txn-lane`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxnLaneEvent {
    pub module: String,
    pub evidence: LaneEvidence,
}

/// Payload of `diagnostic:handler-failure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerFailureEvent {
    pub module: String,
    pub action: String,
    pub message: String,
    /// Set when the failure could not be captured faithfully.
    pub downgrade: Option<String>,
}

/// Payload of `warn:concurrency-pressure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencyPressureEvent {
    pub module: String,
    pub action: String,
    pub backlog: usize,
    pub backlog_age_ms: u64,
    pub limit: Option<usize>,
}

/// A diagnostics event, serialized as `{"type": "<kind>", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DiagnosticEvent {
    #[serde(rename = "trait:converge")]
    Converge(DecisionSummary),
    #[serde(rename = "trace:tick")]
    Tick(TickEvent),
    #[serde(rename = "warn:priority-inversion")]
    PriorityInversion(PriorityInversionEvent),
    #[serde(rename = "warn:deps-mismatch")]
    DepsMismatch(DepsMismatchEvent),
    #[serde(rename = "warn:schema-mismatch")]
    SchemaMismatch(SchemaMismatchEvent),
    #[serde(rename = "trace:txn-lane")]
    TxnLane(TxnLaneEvent),
    #[serde(rename = "diagnostic:handler-failure")]
    HandlerFailure(HandlerFailureEvent),
    #[serde(rename = "warn:concurrency-pressure")]
    ConcurrencyPressure(ConcurrencyPressureEvent),
}

impl DiagnosticEvent {
    /// The serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Converge(_) => "trait:converge",
            Self::Tick(_) => "trace:tick",
            Self::PriorityInversion(_) => "warn:priority-inversion",
            Self::DepsMismatch(_) => "warn:deps-mismatch",
            Self::SchemaMismatch(_) => "warn:schema-mismatch",
            Self::TxnLane(_) => "trace:txn-lane",
            Self::HandlerFailure(_) => "diagnostic:handler-failure",
            Self::ConcurrencyPressure(_) => "warn:concurrency-pressure",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Converge(summary) if summary.degrade_reason.is_some() => Severity::Warning,
            Self::Converge(_) | Self::Tick(_) | Self::TxnLane(_) => Severity::Info,
            Self::HandlerFailure(_) => Severity::Error,
            Self::PriorityInversion(_)
            | Self::DepsMismatch(_)
            | Self::SchemaMismatch(_)
            | Self::ConcurrencyPressure(_) => Severity::Warning,
        }
    }
}

/// Destination of diagnostics events. Must never block.
pub trait DiagnosticsSink: Send + Sync {
    /// Receive one event.
    fn emit(&self, event: &DiagnosticEvent);
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected events.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Collected events with the given `type` tag.
    pub fn of_kind(&self, kind: &str) -> Vec<DiagnosticEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    /// Drain the collected events.
    pub fn take(&self) -> Vec<DiagnosticEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl DiagnosticsSink for MemorySink {
    fn emit(&self, event: &DiagnosticEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Sink that forwards events to `tracing` at their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn emit(&self, event: &DiagnosticEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match event.severity() {
            Severity::Info => info!(kind = event.kind(), %payload, "diagnostic"),
            Severity::Warning => warn!(kind = event.kind(), %payload, "diagnostic"),
            Severity::Error => error!(kind = event.kind(), %payload, "diagnostic"),
        }
    }
}

/// Warn-once and cooldown bookkeeping.
#[derive(Debug, Default)]
pub struct RateLimiter {
    seen: HashSet<String>,
    last: HashMap<String, Instant>,
}

impl RateLimiter {
    /// True the first time `key` is seen.
    pub fn first(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        true
    }

    /// True when `key` has not passed within `cooldown` of `now`.
    pub fn allow(&mut self, key: &str, now: Instant, cooldown: Duration) -> bool {
        match self.last.get(key) {
            Some(at) if now.saturating_duration_since(*at) < cooldown => false,
            _ => {
                self.last.insert(key.to_string(), now);
                true
            }
        }
    }
}

struct DiagnosticsInner {
    config: DiagnosticsConfig,
    sink: Arc<dyn DiagnosticsSink>,
    limiter: Mutex<RateLimiter>,
}

/// Shared, level-gated handle to a diagnostics sink.
#[derive(Clone)]
pub struct Diagnostics {
    inner: Arc<DiagnosticsInner>,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Diagnostics {
    pub fn new(config: DiagnosticsConfig, sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            inner: Arc::new(DiagnosticsInner {
                config,
                sink,
                limiter: Mutex::new(RateLimiter::default()),
            }),
        }
    }

    /// Diagnostics off, forwarding failures to the log.
    pub fn disabled() -> Self {
        Self::new(DiagnosticsConfig::default(), Arc::new(TracingSink))
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.level != DiagnosticsLevel::Off
    }

    /// Detail of the convergence report for transaction `txn_seq`.
    pub fn detail_for(&self, txn_seq: u64) -> Detail {
        match self.inner.config.level {
            DiagnosticsLevel::Off => Detail::None,
            DiagnosticsLevel::Light => Detail::Summary,
            DiagnosticsLevel::Full => Detail::Steps,
            DiagnosticsLevel::Sampled => {
                let n = self.inner.config.sample_every_n.max(1);
                if txn_seq.saturating_sub(1) % n == 0 {
                    Detail::Steps
                } else {
                    Detail::Summary
                }
            }
        }
    }

    /// Emit an event if the level allows it.
    pub fn emit(&self, event: DiagnosticEvent) {
        let always = matches!(event, DiagnosticEvent::HandlerFailure(_));
        if !always && !self.is_enabled() {
            return;
        }
        let sink = &self.inner.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.emit(&event))).is_err() {
            warn!(kind = event.kind(), "diagnostics sink panicked");
        }
    }

    /// Emit the event built by `make` the first time `key` is seen.
    pub fn warn_once(&self, key: &str, make: impl FnOnce() -> DiagnosticEvent) {
        if !self.is_enabled() {
            return;
        }
        let first = self
            .inner
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first(key);
        if first {
            self.emit(make());
        }
    }

    /// Emit the event built by `make` at most once per `cooldown` for `key`.
    pub fn throttled(
        &self,
        key: &str,
        cooldown: Duration,
        make: impl FnOnce() -> DiagnosticEvent,
    ) {
        if !self.is_enabled() {
            return;
        }
        let allowed = self
            .inner
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allow(key, Instant::now(), cooldown);
        if allowed {
            self.emit(make());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_event(path: &str) -> DiagnosticEvent {
        DiagnosticEvent::SchemaMismatch(SchemaMismatchEvent {
            module: "m::i".into(),
            path: path.into(),
        })
    }

    fn with_level(level: DiagnosticsLevel) -> (Diagnostics, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = DiagnosticsConfig {
            level,
            sample_every_n: 4,
            top_k: 3,
        };
        (Diagnostics::new(config, sink.clone()), sink)
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(schema_event("a.b")).unwrap();
        assert_eq!(json["type"], "warn:schema-mismatch");
        assert_eq!(json["path"], "a.b");
    }

    #[test]
    fn test_off_level_only_passes_handler_failures() {
        let (diag, sink) = with_level(DiagnosticsLevel::Off);
        diag.emit(schema_event("a"));
        diag.emit(DiagnosticEvent::HandlerFailure(HandlerFailureEvent {
            module: "m::i".into(),
            action: "save".into(),
            message: "boom".into(),
            downgrade: None,
        }));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "diagnostic:handler-failure");
    }

    #[test]
    fn test_warn_once() {
        let (diag, sink) = with_level(DiagnosticsLevel::Light);
        diag.warn_once("schema:a", || schema_event("a"));
        diag.warn_once("schema:a", || schema_event("a"));
        diag.warn_once("schema:b", || schema_event("b"));
        assert_eq!(sink.of_kind("warn:schema-mismatch").len(), 2);
    }

    #[test]
    fn test_rate_limiter_cooldown() {
        let mut limiter = RateLimiter::default();
        let t0 = Instant::now();
        let cooldown = Duration::from_secs(30);
        assert!(limiter.allow("k", t0, cooldown));
        assert!(!limiter.allow("k", t0 + Duration::from_secs(10), cooldown));
        assert!(limiter.allow("k", t0 + Duration::from_secs(31), cooldown));
    }

    #[test]
    fn test_sampled_detail() {
        let (diag, _) = with_level(DiagnosticsLevel::Sampled);
        assert_eq!(diag.detail_for(1), Detail::Steps);
        assert_eq!(diag.detail_for(2), Detail::Summary);
        assert_eq!(diag.detail_for(5), Detail::Steps);
    }

    struct PanickingSink;

    impl DiagnosticsSink for PanickingSink {
        fn emit(&self, _event: &DiagnosticEvent) {
            panic!("sink failure");
        }
    }

    #[test]
    fn test_panicking_sink_is_isolated() {
        let config = DiagnosticsConfig {
            level: DiagnosticsLevel::Full,
            ..Default::default()
        };
        let diag = Diagnostics::new(config, Arc::new(PanickingSink));
        diag.emit(schema_event("a"));
    }
}
