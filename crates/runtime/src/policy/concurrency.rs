//! Bounded-concurrency policy for watcher fan-out.

use serde::{Deserialize, Serialize};

use super::{ConfigScope, Layers, set};

/// Marker for the `"unbounded"` limit in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnboundedMarker {
    /// No concurrency limit.
    Unbounded,
}

/// Maximum number of handler tasks in flight per watcher.
///
/// Serialized as a number or the string `"unbounded"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConcurrencyLimit {
    /// At most this many handlers at once.
    Bounded(usize),
    /// No limit (only honoured with `allow_unbounded`).
    Unbounded(UnboundedMarker),
}

impl ConcurrencyLimit {
    /// The unbounded limit.
    pub const UNBOUNDED: Self = Self::Unbounded(UnboundedMarker::Unbounded);

    /// Permit count, `None` when unbounded.
    pub fn permits(self) -> Option<usize> {
        match self {
            Self::Bounded(n) => Some(n.max(1)),
            Self::Unbounded(_) => None,
        }
    }
}

/// Backlog thresholds that trigger a pressure warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressureWarningThreshold {
    /// Queued actions before warning.
    pub backlog_count: usize,
    /// Continuous backlog age before warning.
    pub backlog_duration_ms: u64,
}

impl Default for PressureWarningThreshold {
    fn default() -> Self {
        Self {
            backlog_count: 1000,
            backlog_duration_ms: 5000,
        }
    }
}

/// Partial concurrency policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyPolicyPatch {
    pub concurrency_limit: Option<ConcurrencyLimit>,
    pub lossless_backpressure_capacity: Option<usize>,
    pub allow_unbounded: Option<bool>,
    pub pressure_warning_threshold: Option<PressureWarningThreshold>,
    pub warning_cooldown_ms: Option<u64>,
}

/// Effective concurrency policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConcurrencyPolicy {
    /// Limit actually applied.
    pub concurrency_limit: ConcurrencyLimit,
    /// Limit as last requested, which may be an unhonoured `unbounded`.
    pub requested_concurrency_limit: ConcurrencyLimit,
    /// Layer that requested the limit.
    pub requested_scope: ConfigScope,
    /// Capacity of each watcher's action channel.
    pub lossless_backpressure_capacity: usize,
    pub allow_unbounded: bool,
    pub pressure_warning_threshold: PressureWarningThreshold,
    pub warning_cooldown_ms: u64,
    /// Last layer that changed any field.
    pub config_scope: ConfigScope,
}

impl Default for ResolvedConcurrencyPolicy {
    fn default() -> Self {
        Self {
            concurrency_limit: ConcurrencyLimit::Bounded(16),
            requested_concurrency_limit: ConcurrencyLimit::Bounded(16),
            requested_scope: ConfigScope::Builtin,
            lossless_backpressure_capacity: 4096,
            allow_unbounded: false,
            pressure_warning_threshold: PressureWarningThreshold::default(),
            warning_cooldown_ms: 30_000,
            config_scope: ConfigScope::Builtin,
        }
    }
}

/// Resolve the concurrency policy.
///
/// `unbounded` only takes effect when the resolved `allow_unbounded` is
/// true; otherwise the last bounded limit from any layer stays in force.
pub fn resolve_concurrency_policy(
    module: &ConcurrencyPolicyPatch,
    layers: Layers<'_, ConcurrencyPolicyPatch>,
) -> ResolvedConcurrencyPolicy {
    let mut resolved = ResolvedConcurrencyPolicy::default();
    let mut bounded = resolved.concurrency_limit;

    let all = std::iter::once((ConfigScope::Builtin, module)).chain(layers.iter());
    for (scope, patch) in all {
        let mut changed = false;
        if let Some(limit) = patch.concurrency_limit {
            resolved.requested_concurrency_limit = limit;
            resolved.requested_scope = scope;
            if matches!(limit, ConcurrencyLimit::Bounded(_)) {
                bounded = limit;
            }
            changed = true;
        }
        changed |= set(
            &mut resolved.lossless_backpressure_capacity,
            &patch.lossless_backpressure_capacity,
        );
        changed |= set(&mut resolved.allow_unbounded, &patch.allow_unbounded);
        changed |= set(
            &mut resolved.pressure_warning_threshold,
            &patch.pressure_warning_threshold,
        );
        changed |= set(&mut resolved.warning_cooldown_ms, &patch.warning_cooldown_ms);
        if changed {
            resolved.config_scope = scope;
        }
    }

    resolved.lossless_backpressure_capacity = resolved.lossless_backpressure_capacity.max(1);
    resolved.concurrency_limit = match resolved.requested_concurrency_limit {
        ConcurrencyLimit::Unbounded(_) if resolved.allow_unbounded => ConcurrencyLimit::UNBOUNDED,
        _ => bounded,
    };
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers<'a>(
        runtime_default: Option<&'a ConcurrencyPolicyPatch>,
        provider: Option<&'a ConcurrencyPolicyPatch>,
    ) -> Layers<'a, ConcurrencyPolicyPatch> {
        Layers {
            runtime_default,
            runtime_module: None,
            provider,
        }
    }

    #[test]
    fn test_defaults() {
        let resolved = resolve_concurrency_policy(&Default::default(), layers(None, None));
        assert_eq!(resolved.concurrency_limit, ConcurrencyLimit::Bounded(16));
        assert_eq!(resolved.lossless_backpressure_capacity, 4096);
        assert_eq!(resolved.config_scope, ConfigScope::Builtin);
    }

    #[test]
    fn test_unbounded_requires_opt_in() {
        let defaults = ConcurrencyPolicyPatch {
            concurrency_limit: Some(ConcurrencyLimit::Bounded(4)),
            ..Default::default()
        };
        let provider = ConcurrencyPolicyPatch {
            concurrency_limit: Some(ConcurrencyLimit::UNBOUNDED),
            ..Default::default()
        };

        let resolved =
            resolve_concurrency_policy(&Default::default(), layers(Some(&defaults), Some(&provider)));
        assert_eq!(resolved.concurrency_limit, ConcurrencyLimit::Bounded(4));
        assert_eq!(resolved.requested_concurrency_limit, ConcurrencyLimit::UNBOUNDED);
        assert_eq!(resolved.requested_scope, ConfigScope::Provider);

        let allow = ConcurrencyPolicyPatch {
            allow_unbounded: Some(true),
            ..provider.clone()
        };
        let resolved =
            resolve_concurrency_policy(&Default::default(), layers(Some(&defaults), Some(&allow)));
        assert_eq!(resolved.concurrency_limit, ConcurrencyLimit::UNBOUNDED);
        assert_eq!(resolved.concurrency_limit.permits(), None);
    }

    #[test]
    fn test_limit_parses_number_or_keyword() {
        let patch: ConcurrencyPolicyPatch =
            serde_json::from_str(r#"{"concurrency_limit": "unbounded"}"#).unwrap();
        assert_eq!(patch.concurrency_limit, Some(ConcurrencyLimit::UNBOUNDED));
        let patch: ConcurrencyPolicyPatch =
            serde_json::from_str(r#"{"concurrency_limit": 8}"#).unwrap();
        assert_eq!(patch.concurrency_limit, Some(ConcurrencyLimit::Bounded(8)));
    }
}
