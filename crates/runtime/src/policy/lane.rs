//! Transaction lane policy.
//!
//! Lanes decide how deferred work re-enters the scheduler: with lanes
//! enabled a deferred flush is committed at low priority so urgent work
//! overtakes it; the override modes collapse everything onto one FIFO queue
//! for deterministic testing.

use serde::{Deserialize, Serialize};

use super::{ConfigPatch, Layers, Resolved, resolve_layers, set};

/// Forced lane behaviour for tests and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneOverrideMode {
    /// Deferred work runs inline, no lane evidence.
    ForcedOff,
    /// Deferred work runs inline and still records lane evidence.
    ForcedSync,
}

/// How the lane yields between slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YieldStrategy {
    /// Yield on the time budget only.
    #[default]
    Baseline,
    /// Also yield when input is pending.
    InputPending,
}

/// Queueing discipline derived from the lane policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Single FIFO queue.
    Fifo,
    /// Urgent and non-urgent lanes.
    Lanes,
}

/// Effective lane policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanePolicy {
    /// Whether lanes are active.
    pub enabled: bool,
    /// Forced behaviour, if any.
    pub override_mode: Option<LaneOverrideMode>,
    /// Time budget of one deferred slice.
    pub budget_ms: u64,
    /// Lower bound on the deferred lane's debounce window.
    pub debounce_ms: u64,
    /// Lower bound on the deferred lane's staleness limit.
    pub max_lag_ms: u64,
    /// Whether signals arriving during a wait are merged.
    pub allow_coalesce: bool,
    /// Yield strategy.
    pub yield_strategy: YieldStrategy,
}

impl Default for LanePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            override_mode: None,
            budget_ms: 1,
            debounce_ms: 0,
            max_lag_ms: 50,
            allow_coalesce: true,
            yield_strategy: YieldStrategy::Baseline,
        }
    }
}

/// Partial lane policy; every field optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanePolicyPatch {
    pub enabled: Option<bool>,
    pub override_mode: Option<LaneOverrideMode>,
    pub budget_ms: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub max_lag_ms: Option<u64>,
    pub allow_coalesce: Option<bool>,
    pub yield_strategy: Option<YieldStrategy>,
}

impl ConfigPatch for LanePolicyPatch {
    type Target = LanePolicy;

    fn apply_to(&self, target: &mut LanePolicy) -> bool {
        let mut changed = set(&mut target.enabled, &self.enabled);
        if let Some(mode) = self.override_mode {
            target.override_mode = Some(mode);
            changed = true;
        }
        changed |= set(&mut target.budget_ms, &self.budget_ms);
        changed |= set(&mut target.debounce_ms, &self.debounce_ms);
        changed |= set(&mut target.max_lag_ms, &self.max_lag_ms);
        changed |= set(&mut target.allow_coalesce, &self.allow_coalesce);
        changed |= set(&mut target.yield_strategy, &self.yield_strategy);
        changed
    }
}

/// Lane policy after resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLanePolicy {
    /// Effective policy. An override mode forces `enabled = false`.
    pub policy: LanePolicy,
    /// Queueing discipline implied by the policy.
    pub queue_mode: QueueMode,
    /// Last layer that changed the policy.
    pub config_scope: super::ConfigScope,
}

impl ResolvedLanePolicy {
    /// Whether deferred flushes should enter the low-priority lane.
    pub fn lanes_active(&self) -> bool {
        self.policy.enabled && self.queue_mode == QueueMode::Lanes
    }
}

/// Resolve the lane policy through the standard layers.
pub fn resolve_lane_policy(
    module: &LanePolicyPatch,
    layers: Layers<'_, LanePolicyPatch>,
) -> ResolvedLanePolicy {
    let Resolved {
        value: mut policy,
        config_scope,
    } = resolve_layers(LanePolicy::default(), module, layers);

    let queue_mode = if policy.override_mode.is_some() {
        policy.enabled = false;
        QueueMode::Fifo
    } else {
        QueueMode::Lanes
    };

    ResolvedLanePolicy {
        policy,
        queue_mode,
        config_scope,
    }
}
