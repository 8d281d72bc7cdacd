//! Per-transaction convergence state.

use std::time::Instant;

use converge_foundation::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dirty::DirtySet;

/// Origin of a recorded patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchReason {
    /// A user mutation inside a transaction body.
    Reducer,
    TraitComputed,
    TraitLink,
    /// A resource-backed field was refreshed.
    SourceRefresh,
    Devtools,
    Perf,
    Unknown,
}

impl PatchReason {
    /// Parse a reason tag; any `source:*` tag is a source refresh.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "reducer" => Self::Reducer,
            "trait-computed" => Self::TraitComputed,
            "trait-link" => Self::TraitLink,
            "source-refresh" => Self::SourceRefresh,
            "devtools" => Self::Devtools,
            "perf" => Self::Perf,
            other if other.starts_with("source:") => Self::SourceRefresh,
            _ => Self::Unknown,
        }
    }
}

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Patch {
    /// Written path, as given by the writer.
    pub path: String,
    pub reason: PatchReason,
    pub prev: Option<Value>,
    pub next: Option<Value>,
    /// Step that produced the write, for derived patches.
    pub step: Option<StepId>,
}

/// Mutable state of one transaction: the draft being built, its patch log
/// and the dirty roots accumulated by user writes.
#[derive(Debug, Clone)]
pub struct ConvergeContext {
    pub draft: Value,
    pub patches: Vec<Patch>,
    pub dirty: DirtySet,
    pub txn_seq: u64,
    pub started: Instant,
}

impl ConvergeContext {
    pub fn new(draft: Value, txn_seq: u64) -> Self {
        Self {
            draft,
            patches: Vec::new(),
            dirty: DirtySet::new(),
            txn_seq,
            started: Instant::now(),
        }
    }

    /// Append a patch.
    pub fn record(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    /// Patches written by derivation steps.
    pub fn derived_patches(&self) -> impl Iterator<Item = &Patch> {
        self.patches
            .iter()
            .filter(|p| matches!(p.reason, PatchReason::TraitComputed | PatchReason::TraitLink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_reason_normalization() {
        assert_eq!(PatchReason::normalize("reducer"), PatchReason::Reducer);
        assert_eq!(PatchReason::normalize("source:users"), PatchReason::SourceRefresh);
        assert_eq!(PatchReason::normalize("mystery"), PatchReason::Unknown);
        assert_eq!(
            serde_json::to_value(PatchReason::TraitComputed).unwrap(),
            "trait-computed"
        );
    }
}
