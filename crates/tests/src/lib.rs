//! Integration test harness for the converge runtime.
//!
//! [`ScenarioHarness`] drives a [`Runtime`] through transactions and flushes
//! while collecting every diagnostics event, and [`scenarios`] holds the
//! module declarations the integration tests and the `converge-run` CLI
//! share.

use std::sync::{Arc, Once};

use converge_foundation::ModuleKey;
use converge_runtime::converge::Patch;
use converge_runtime::{
    DiagnosticEvent, DiagnosticsConfig, DiagnosticsLevel, MemorySink, ModuleDeclaration,
    PatchReason, Runtime, RuntimeConfig, StateTransaction, TickReport, TxnMeta,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

pub mod scenarios;

/// Install a `tracing` subscriber once; later calls are no-ops.
///
/// Honors `RUST_LOG`, defaulting to `info,converge_runtime=debug`.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,converge_runtime=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A runtime plus the events and tick reports it produced.
pub struct ScenarioHarness {
    runtime: Runtime,
    sink: Arc<MemorySink>,
    reports: Vec<TickReport>,
}

impl Default for ScenarioHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioHarness {
    /// Harness with default configuration and full diagnostics.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Harness with `config`; diagnostics that are off are turned to full so
    /// every event is collected.
    pub fn with_config(mut config: RuntimeConfig) -> Self {
        init_logging();
        if config.diagnostics.level == DiagnosticsLevel::Off {
            config.diagnostics = DiagnosticsConfig {
                level: DiagnosticsLevel::Full,
                ..config.diagnostics
            };
        }
        let sink = Arc::new(MemorySink::new());
        Self {
            runtime: Runtime::with_sink(config, sink.clone()),
            sink,
            reports: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Register an instance.
    ///
    /// # Panics
    ///
    /// Panics if the declaration does not compile.
    pub fn register(&self, declaration: &ModuleDeclaration, id: &str, initial: Value) -> ModuleKey {
        self.runtime
            .register_module(declaration, id, initial)
            .unwrap_or_else(|e| panic!("registering {id} failed: {e}"))
    }

    /// Queue a single write.
    ///
    /// # Panics
    ///
    /// Panics if the write is rejected.
    pub fn set(&self, key: &ModuleKey, path: &str, value: Value) {
        self.runtime
            .set(key, path, value)
            .unwrap_or_else(|e| panic!("write to {key}.{path} failed: {e}"));
    }

    /// Run a transaction body.
    ///
    /// # Panics
    ///
    /// Panics if the transaction fails.
    pub fn transact(
        &self,
        key: &ModuleKey,
        meta: TxnMeta,
        body: impl FnOnce(&mut StateTransaction) -> converge_runtime::Result<()>,
    ) {
        self.runtime
            .run_with_state_transaction(key, meta, body)
            .unwrap_or_else(|e| panic!("transaction on {key} failed: {e}"));
    }

    /// Run one tick and keep its report.
    pub fn flush(&mut self) -> TickReport {
        let report = self.runtime.flush_now();
        self.reports.push(report.clone());
        report
    }

    /// Flush until idle, at most `max_ticks` times.
    pub fn flush_until_idle(&mut self, max_ticks: usize) -> Vec<TickReport> {
        let reports = self.runtime.flush_until_idle(max_ticks);
        self.reports.extend(reports.iter().cloned());
        reports
    }

    /// Every tick report kept so far.
    pub fn reports(&self) -> &[TickReport] {
        &self.reports
    }

    /// Committed state of an instance.
    ///
    /// # Panics
    ///
    /// Panics if the instance is unknown.
    pub fn state(&self, key: &ModuleKey) -> Value {
        self.runtime
            .state(key)
            .unwrap_or_else(|e| panic!("state of {key}: {e}"))
    }

    /// One field of an instance's committed state.
    pub fn get(&self, key: &ModuleKey, path: &str) -> Option<Value> {
        self.runtime.read(key, path).ok().flatten()
    }

    /// Collected events of one kind.
    pub fn events(&self, kind: &str) -> Vec<DiagnosticEvent> {
        self.sink.of_kind(kind)
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }
}

/// Patches of `key` in `report`, optionally only those of one reason.
pub fn patches_of<'a>(
    report: &'a TickReport,
    key: &ModuleKey,
    reason: Option<PatchReason>,
) -> Vec<&'a Patch> {
    report
        .unit(key)
        .map(|unit| {
            unit.patches
                .iter()
                .filter(|p| reason.is_none_or(|r| p.reason == r))
                .collect()
        })
        .unwrap_or_default()
}

/// Paths of the derived (computed and link) patches of `key`, in order.
pub fn derived_paths(report: &TickReport, key: &ModuleKey) -> Vec<String> {
    patches_of(report, key, None)
        .into_iter()
        .filter(|p| matches!(p.reason, PatchReason::TraitComputed | PatchReason::TraitLink))
        .map(|p| p.path.clone())
        .collect()
}
