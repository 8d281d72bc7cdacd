//! State transactions.
//!
//! A transaction body runs against a private draft of an instance's state
//! (the committed state plus everything already queued). Tracked writes
//! record their path as a dirty root and a `reducer` patch; untracked
//! mutations replace the whole state and mark every field dirty unless the
//! body reports the touched paths with
//! [`StateTransaction::record_state_patch`].

use converge_foundation::{FieldPath, ModuleKey, WILDCARD};
use serde_json::Value;

use crate::converge::{DirtyAllReason, DirtySet, Patch, PatchReason};
use crate::error::{Error, Result};
use crate::state::{self, StatePath};
use crate::store::{Commit, CommitKind, Origin, Priority};

/// Metadata attached to a transaction's commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnMeta {
    pub priority: Priority,
    pub origin_kind: String,
    pub origin_name: Option<String>,
}

impl Default for TxnMeta {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            origin_kind: "action".into(),
            origin_name: None,
        }
    }
}

impl TxnMeta {
    /// Normal-priority transaction for a named action.
    pub fn action(name: impl Into<String>) -> Self {
        Self {
            origin_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_origin_kind(mut self, kind: impl Into<String>) -> Self {
        self.origin_kind = kind.into();
        self
    }
}

/// Mutable view of one instance's state inside a transaction body.
#[derive(Debug)]
pub struct StateTransaction {
    key: ModuleKey,
    draft: Value,
    writes: Vec<(StatePath, Value)>,
    dirty: DirtySet,
    patches: Vec<Patch>,
    replaced: bool,
    untracked: bool,
}

impl StateTransaction {
    pub(crate) fn new(key: ModuleKey, draft: Value) -> Self {
        Self {
            key,
            draft,
            writes: Vec::new(),
            dirty: DirtySet::new(),
            patches: Vec::new(),
            replaced: false,
            untracked: false,
        }
    }

    /// Instance this transaction writes to.
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    /// Current draft, including this transaction's writes.
    pub fn state(&self) -> &Value {
        &self.draft
    }

    /// Read a field of the draft.
    pub fn get(&self, path: &str) -> Option<Value> {
        let path = FieldPath::parse(path).ok()?;
        state::read_value(&self.draft, &path)
    }

    /// Write `value` at a concrete path such as `items[2].price`.
    ///
    /// Writing a value equal to the current one records nothing.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let target = StatePath::parse(path).map_err(|source| Error::InvalidFieldPath {
            raw: path.to_string(),
            context: format!("transaction write on {}", self.key),
            source,
        })?;
        let normalized = target
            .normalized()
            .map_err(|source| Error::InvalidFieldPath {
                raw: path.to_string(),
                context: format!("transaction write on {}", self.key),
                source,
            })?;

        let prev = state::lookup_at(&self.draft, &target).cloned();
        if prev.as_ref() == Some(&value) {
            return Ok(());
        }

        state::write_at(&mut self.draft, &target, value.clone());
        self.writes.push((target, value.clone()));
        self.dirty.insert(normalized);
        self.patches.push(Patch {
            path: path.to_string(),
            reason: PatchReason::Reducer,
            prev,
            next: Some(value),
            step: None,
        });
        Ok(())
    }

    /// Mutate the draft directly.
    ///
    /// Unless the touched paths are reported afterwards with
    /// [`StateTransaction::record_state_patch`], every field counts as
    /// dirty (`custom_mutation`).
    pub fn update(&mut self, f: impl FnOnce(&mut Value)) {
        f(&mut self.draft);
        self.replaced = true;
        self.untracked = true;
    }

    /// Report a path changed by [`StateTransaction::update`].
    ///
    /// `*` or an empty path is an unknown write and an unparseable path is
    /// not trackable; both mark every field dirty.
    pub fn record_state_patch(&mut self, path: &str, reason: PatchReason) {
        self.untracked = false;
        if path.is_empty() || path == WILDCARD {
            self.dirty.mark_all(DirtyAllReason::UnknownWrite);
            return;
        }
        let Ok(normalized) = FieldPath::parse(path) else {
            self.dirty.mark_all(DirtyAllReason::NonTrackablePatch);
            return;
        };
        self.patches.push(Patch {
            path: path.to_string(),
            reason,
            prev: None,
            next: state::read_value(&self.draft, &normalized),
            step: None,
        });
        self.dirty.insert(normalized);
    }

    /// Mark every field dirty.
    pub fn mark_dirty_all(&mut self, reason: DirtyAllReason) {
        self.dirty.mark_all(reason);
    }

    /// Dirty roots recorded so far.
    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// The commit for this transaction, or `None` if it changed nothing.
    pub(crate) fn into_commit(mut self, meta: &TxnMeta) -> Option<Commit> {
        if self.untracked {
            self.dirty.mark_all(DirtyAllReason::CustomMutation);
        }
        if self.dirty.is_empty() && !self.replaced {
            return None;
        }
        let mut commit = Commit::new(
            CommitKind::Transaction,
            meta.priority,
            Origin::new(meta.origin_kind.clone(), meta.origin_name.clone()),
        );
        if self.replaced {
            commit.replace = Some(self.draft);
        } else {
            commit.writes = self.writes;
        }
        commit.dirty = self.dirty;
        commit.patches = self.patches;
        Some(commit)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn txn(draft: Value) -> StateTransaction {
        StateTransaction::new(ModuleKey::new("m", "i"), draft)
    }

    #[test]
    fn test_set_records_reducer_patch_and_normalized_root() {
        let mut t = txn(json!({"items": [{"price": 1}, {"price": 2}]}));
        t.set("items[1].price", json!(5)).unwrap();
        assert_eq!(t.state()["items"][1]["price"], json!(5));
        assert_eq!(t.dirty().roots(), &[FieldPath::parse("items.*.price").unwrap()]);

        let commit = t.into_commit(&TxnMeta::action("reprice")).unwrap();
        assert!(commit.replace.is_none());
        assert_eq!(commit.writes.len(), 1);
        assert_eq!(commit.patches[0].reason, PatchReason::Reducer);
        assert_eq!(commit.patches[0].prev, Some(json!(2)));
        assert_eq!(commit.origin.name.as_deref(), Some("reprice"));
    }

    #[test]
    fn test_unchanged_write_records_nothing() {
        let mut t = txn(json!({"a": 1}));
        t.set("a", json!(1)).unwrap();
        assert!(t.into_commit(&TxnMeta::default()).is_none());
    }

    #[test]
    fn test_invalid_write_path_is_rejected() {
        let mut t = txn(json!({}));
        assert!(matches!(t.set("*", json!(1)), Err(Error::InvalidFieldPath { .. })));
        assert!(matches!(t.set("", json!(1)), Err(Error::InvalidFieldPath { .. })));
    }

    #[test]
    fn test_untracked_update_marks_custom_mutation() {
        let mut t = txn(json!({"a": 1}));
        t.update(|s| s["a"] = json!(2));
        let commit = t.into_commit(&TxnMeta::default()).unwrap();
        assert_eq!(commit.replace, Some(json!({"a": 2})));
        assert_eq!(commit.dirty.dirty_all(), Some(DirtyAllReason::CustomMutation));
    }

    #[test]
    fn test_reported_update_stays_incremental() {
        let mut t = txn(json!({"a": 1, "b": 1}));
        t.update(|s| s["b"] = json!(3));
        t.record_state_patch("b", PatchReason::Reducer);
        let commit = t.into_commit(&TxnMeta::default()).unwrap();
        assert_eq!(commit.dirty.roots(), &[FieldPath::parse("b").unwrap()]);
        assert_eq!(commit.patches[0].next, Some(json!(3)));
    }

    #[test]
    fn test_untrackable_patch_reasons() {
        let mut t = txn(json!({}));
        t.record_state_patch("*", PatchReason::Unknown);
        assert_eq!(t.dirty().dirty_all(), Some(DirtyAllReason::UnknownWrite));

        let mut t = txn(json!({}));
        t.record_state_patch("a[x]", PatchReason::Unknown);
        assert_eq!(t.dirty().dirty_all(), Some(DirtyAllReason::NonTrackablePatch));
    }
}
