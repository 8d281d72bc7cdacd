//! Runtime configuration.
//!
//! Everything here is plain `serde` data so a host can load it from JSON;
//! reading files is left to the host. Per-module knobs are expressed as
//! patches and resolved through [`crate::policy`] layering.

use std::time::Duration;

use converge_foundation::ModuleId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::declaration::ModuleOptions;
use crate::diagnostics::DiagnosticsConfig;
use crate::policy::concurrency::{
    ConcurrencyPolicyPatch, ResolvedConcurrencyPolicy, resolve_concurrency_policy,
};
use crate::policy::lane::{LanePolicyPatch, ResolvedLanePolicy, resolve_lane_policy};
use crate::policy::{ConfigPatch, Layers, Resolved, resolve_layers, set};

/// Minimum per-pass step cap.
pub const MIN_STEP_CAP: usize = 64;

/// How a convergence pass chooses between a full and an incremental run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergeMode {
    /// Decide per pass from the dirty set.
    #[default]
    Auto,
    /// Always run every step of the scope.
    Full,
    /// Always run only the reachable plan.
    Dirty,
}

/// Debounced execution of deferred steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlicingConfig {
    /// Route deferred steps to the lane. When off they run inline.
    pub enabled: bool,
    /// Quiet period before the lane runs.
    pub debounce_ms: u64,
    /// Maximum staleness of deferred fields.
    pub max_lag_ms: u64,
}

impl Default for TimeSlicingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 16,
            max_lag_ms: 200,
        }
    }
}

/// Effective convergence settings for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergeConfig {
    pub mode: ConvergeMode,
    /// Wall-clock budget of one convergence call.
    pub budget_ms: u64,
    /// Budget for computing a plan before falling back to a full run.
    pub decision_budget_ms: f64,
    /// Step cap per convergence call; derived from the scope size when unset.
    pub step_cap: Option<usize>,
    pub time_slicing: TimeSlicingConfig,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            mode: ConvergeMode::Auto,
            budget_ms: 200,
            decision_budget_ms: 0.5,
            step_cap: None,
            time_slicing: TimeSlicingConfig::default(),
        }
    }
}

impl ConvergeConfig {
    /// Step cap for a scope with `steps` steps.
    pub fn step_cap_for(&self, steps: usize) -> usize {
        self.step_cap
            .unwrap_or_else(|| MIN_STEP_CAP.max(steps.saturating_mul(8)))
            .max(1)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn decision_budget(&self) -> Duration {
        Duration::from_secs_f64(self.decision_budget_ms.max(0.0) / 1000.0)
    }
}

/// Partial time-slicing settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSlicingPatch {
    pub enabled: Option<bool>,
    pub debounce_ms: Option<u64>,
    pub max_lag_ms: Option<u64>,
}

/// Partial convergence settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfigPatch {
    pub mode: Option<ConvergeMode>,
    pub budget_ms: Option<u64>,
    pub decision_budget_ms: Option<f64>,
    pub step_cap: Option<usize>,
    pub time_slicing: Option<TimeSlicingPatch>,
}

impl ConfigPatch for ConvergeConfigPatch {
    type Target = ConvergeConfig;

    fn apply_to(&self, target: &mut ConvergeConfig) -> bool {
        let mut changed = set(&mut target.mode, &self.mode);
        changed |= set(&mut target.budget_ms, &self.budget_ms);
        changed |= set(&mut target.decision_budget_ms, &self.decision_budget_ms);
        if let Some(cap) = self.step_cap {
            target.step_cap = Some(cap);
            changed = true;
        }
        if let Some(ts) = &self.time_slicing {
            changed |= set(&mut target.time_slicing.enabled, &ts.enabled);
            changed |= set(&mut target.time_slicing.debounce_ms, &ts.debounce_ms);
            changed |= set(&mut target.time_slicing.max_lag_ms, &ts.max_lag_ms);
        }
        changed
    }
}

/// Tick scheduler limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Accepted instance units per tick, urgent units included.
    pub max_steps: usize,
    /// Convergence steps urgent units may run per tick.
    pub urgent_step_cap: usize,
    /// Cascade rounds absorbed within one flush.
    pub max_drain_rounds: usize,
    /// Sample rate for degraded-tick telemetry; off when unset.
    pub telemetry_sample_rate: Option<f64>,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            max_steps: 64,
            urgent_step_cap: 512,
            max_drain_rounds: 8,
            telemetry_sample_rate: None,
        }
    }
}

/// One layer of per-module overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideSet {
    pub converge: ConvergeConfigPatch,
    pub lanes: LanePolicyPatch,
    pub concurrency: ConcurrencyPolicyPatch,
}

/// Configuration of a [`crate::Runtime`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick: TickConfig,
    pub diagnostics: DiagnosticsConfig,
    /// Overrides applied to every module (`runtime_default`).
    pub defaults: OverrideSet,
    /// Overrides keyed by module id (`runtime_module`).
    pub modules: IndexMap<ModuleId, OverrideSet>,
}

/// All policies resolved for one module instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPolicies {
    pub converge: Resolved<ConvergeConfig>,
    pub lanes: ResolvedLanePolicy,
    pub concurrency: ResolvedConcurrencyPolicy,
}

impl ResolvedPolicies {
    /// Resolve every policy for `module` with precedence
    /// `provider > runtime_module > runtime_default > builtin`.
    pub fn resolve(
        config: &RuntimeConfig,
        module: &ModuleId,
        options: &ModuleOptions,
        provider: Option<&OverrideSet>,
    ) -> Self {
        let module_overrides = config.modules.get(module);

        Self {
            converge: resolve_layers(
                ConvergeConfig::default(),
                &options.converge,
                Layers {
                    runtime_default: Some(&config.defaults.converge),
                    runtime_module: module_overrides.map(|o| &o.converge),
                    provider: provider.map(|o| &o.converge),
                },
            ),
            lanes: resolve_lane_policy(
                &options.lanes,
                Layers {
                    runtime_default: Some(&config.defaults.lanes),
                    runtime_module: module_overrides.map(|o| &o.lanes),
                    provider: provider.map(|o| &o.lanes),
                },
            ),
            concurrency: resolve_concurrency_policy(
                &options.concurrency,
                Layers {
                    runtime_default: Some(&config.defaults.concurrency),
                    runtime_module: module_overrides.map(|o| &o.concurrency),
                    provider: provider.map(|o| &o.concurrency),
                },
            ),
        }
    }

    /// Debounce and staleness bound of the deferred lane.
    ///
    /// Time slicing sets the window; an active lane policy can only widen it.
    pub fn lane_timing(&self) -> (Duration, Duration) {
        let ts = &self.converge.value.time_slicing;
        let (mut debounce, mut max_lag) = (ts.debounce_ms, ts.max_lag_ms);
        if self.lanes.lanes_active() {
            debounce = debounce.max(self.lanes.policy.debounce_ms);
            max_lag = max_lag.max(self.lanes.policy.max_lag_ms);
        }
        (
            Duration::from_millis(debounce),
            Duration::from_millis(max_lag.max(debounce)),
        )
    }
}
