//! Convergence of derived fields after a mutation.
//!
//! # Structure
//!
//! - [`DirtySet`] - Canonical dirty roots of a transaction
//! - [`ConvergeContext`] - Draft, patch log and dirty roots of one transaction
//! - [`ConvergeExecutor`] - Runs the reachable steps to a fixpoint under caps
//! - [`PlanCache`] - Per-instance LRU of computed plans
//! - [`deferred::DeferredLane`] - Debounced execution of deferred steps
//!
//! # Execution Model
//!
//! A pass decides between running every step of its scope and running only
//! the plan reachable from the dirty roots, then walks the chosen steps in
//! topological order. A step that changes its output marks the output dirty
//! so later steps see it; a change that feeds an earlier step starts another
//! round. The pass stops at a fixpoint or at its step cap or time budget; on
//! a cap the writes so far are kept and the unfinished work is returned as
//! [`CarriedWork`] for the next tick.

pub mod context;
pub mod deferred;
pub mod dirty;
mod executor;
mod plan_cache;
mod step;


use std::time::Duration;

use converge_foundation::{FieldPath, ModuleKey};
use serde::Serialize;

use crate::config::ConvergeMode;
use crate::ir::Scope;

pub use context::{ConvergeContext, Patch, PatchReason};
pub use dirty::{DirtyAllReason, DirtySet, DirtySummary, ResolvedDirty};
pub use executor::{ConvergeExecutor, ConvergeRequest};
pub use plan_cache::{PlanCache, PlanCacheStats};

/// Why a pass or tick stopped short of stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// A step cap was exhausted.
    CycleDetected,
    /// The time budget was exhausted.
    BudgetSteps,
    /// A derive function failed; its writes were rolled back.
    RuntimeError,
}

/// What a pass actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutedMode {
    Full,
    Dirty,
    /// Nothing was dirty.
    Noop,
}

/// Why a pass ran the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// The mode was fixed by configuration.
    ModuleOverride,
    /// First transaction of the instance.
    ColdStart,
    DirtyAll,
    /// The dirty roots cover most registered paths.
    NearFull,
    /// Plan computation ran out of decision budget.
    PlanCutoff,
    /// The plan covers most of the scope.
    PlanNearFull,
    CacheHit,
    CacheMiss,
    /// Work carried from a degraded pass was resumed.
    Carried,
}

/// Wall time of one step, reported for hotspots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepTiming {
    pub label: String,
    pub duration_us: f64,
}

/// Payload of `trait:converge`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionSummary {
    pub module: String,
    pub txn_seq: u64,
    pub scope: Scope,
    pub requested_mode: ConvergeMode,
    pub executed_mode: ExecutedMode,
    pub reasons: Vec<DecisionReason>,
    pub dirty: DirtySummary,
    /// Steps in the scope.
    pub step_count: usize,
    pub plan_len: usize,
    pub executed_steps: usize,
    pub changed_steps: usize,
    pub rounds: usize,
    pub stable: bool,
    pub degrade_reason: Option<DegradeReason>,
    /// Summary of a derive failure.
    pub error: Option<String>,
    pub cache: Option<PlanCacheStats>,
    pub decision_ms: f64,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_steps: Vec<StepTiming>,
}

impl DecisionSummary {
    pub(crate) fn new(
        key: &ModuleKey,
        txn_seq: u64,
        scope: Scope,
        requested_mode: ConvergeMode,
        dirty: DirtySummary,
    ) -> Self {
        Self {
            module: key.to_string(),
            txn_seq,
            scope,
            requested_mode,
            executed_mode: ExecutedMode::Noop,
            reasons: Vec::new(),
            dirty,
            step_count: 0,
            plan_len: 0,
            executed_steps: 0,
            changed_steps: 0,
            rounds: 0,
            stable: true,
            degrade_reason: None,
            error: None,
            cache: None,
            decision_ms: 0.0,
            duration_ms: 0.0,
            top_steps: Vec::new(),
        }
    }
}

/// Unfinished work of a capped pass, expressed in paths so it survives a
/// recompilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CarriedWork {
    /// Changes not yet propagated to earlier steps.
    pub dirty_roots: Vec<FieldPath>,
    /// Outputs of steps that were due but did not run.
    pub forced_outs: Vec<FieldPath>,
}

impl CarriedWork {
    pub fn is_empty(&self) -> bool {
        self.dirty_roots.is_empty() && self.forced_outs.is_empty()
    }

    pub fn merge(&mut self, other: CarriedWork) {
        for root in other.dirty_roots {
            if !self.dirty_roots.contains(&root) {
                self.dirty_roots.push(root);
            }
        }
        for out in other.forced_outs {
            if !self.forced_outs.contains(&out) {
                self.forced_outs.push(out);
            }
        }
    }
}

/// Result of one convergence pass.
#[derive(Debug, Clone)]
pub struct ConvergeOutcome {
    pub stable: bool,
    pub degrade: Option<DegradeReason>,
    pub executed_steps: usize,
    /// Outputs written by the pass, in write order.
    pub changed: Vec<FieldPath>,
    pub carried: Option<CarriedWork>,
    pub summary: DecisionSummary,
    pub elapsed: Duration,
}
