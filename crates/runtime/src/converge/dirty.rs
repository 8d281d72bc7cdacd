//! Dirty path sets and their canonical id form.

use converge_foundation::{FieldPath, FieldPathId, canonicalize_roots, fnv1a32_ids};
use serde::{Deserialize, Serialize};

use crate::ir::FieldPathRegistry;

/// Why a mutation could not be narrowed to specific paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyAllReason {
    /// A wildcard write, or a write with no specific root.
    UnknownWrite,
    /// A mutation that recorded no patch paths.
    CustomMutation,
    /// A patch path that could not be normalized.
    NonTrackablePatch,
    /// Tracking was abandoned by policy (lane backlog overflow).
    FallbackPolicy,
}

/// Paths touched by one or more mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtySet {
    roots: Vec<FieldPath>,
    dirty_all: Option<DirtyAllReason>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything is dirty.
    pub fn all(reason: DirtyAllReason) -> Self {
        Self {
            roots: Vec::new(),
            dirty_all: Some(reason),
        }
    }

    pub fn from_paths<I: IntoIterator<Item = FieldPath>>(paths: I) -> Self {
        let mut set = Self::new();
        for path in paths {
            set.insert(path);
        }
        set
    }

    /// Add one root; the set is kept canonical (sorted and prefix-free).
    pub fn insert(&mut self, path: FieldPath) {
        if self.dirty_all.is_some() {
            return;
        }
        if self.roots.iter().any(|r| r.is_prefix_of(&path)) {
            return;
        }
        self.roots.retain(|r| !path.is_prefix_of(r));
        let at = self.roots.partition_point(|r| *r < path);
        self.roots.insert(at, path);
    }

    /// Widen to dirty-all; the first reason wins.
    pub fn mark_all(&mut self, reason: DirtyAllReason) {
        if self.dirty_all.is_none() {
            self.dirty_all = Some(reason);
        }
        self.roots.clear();
    }

    /// Merge another set into this one.
    pub fn union(&mut self, other: &DirtySet) {
        if let Some(reason) = other.dirty_all {
            self.mark_all(reason);
            return;
        }
        for root in &other.roots {
            self.insert(root.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirty_all.is_none() && self.roots.is_empty()
    }

    pub fn dirty_all(&self) -> Option<DirtyAllReason> {
        self.dirty_all
    }

    /// Canonical roots.
    pub fn roots(&self) -> &[FieldPath] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Map the roots onto registered ids.
    ///
    /// An unregistered root maps to its deepest registered ancestor. A root
    /// with no registered ancestor cannot overlap any step (every prefix of
    /// every step path is registered) and is dropped.
    pub fn resolve(&self, registry: &FieldPathRegistry) -> ResolvedDirty {
        if let Some(reason) = self.dirty_all {
            return ResolvedDirty {
                ids: Vec::new(),
                key_hash: 0,
                dirty_all: Some(reason),
            };
        }

        let mapped = self
            .roots
            .iter()
            .filter_map(|root| registry.resolve(root))
            .map(|id| registry.path(id).clone());
        let mut ids: Vec<FieldPathId> = canonicalize_roots(mapped)
            .iter()
            .filter_map(|p| registry.id(p))
            .collect();
        ids.sort();

        let raw: Vec<u32> = ids.iter().map(|id| id.0).collect();
        ResolvedDirty {
            key_hash: fnv1a32_ids(&raw),
            ids,
            dirty_all: None,
        }
    }
}

/// A dirty set expressed in one IR generation's ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedDirty {
    /// Sorted, prefix-free root ids.
    pub ids: Vec<FieldPathId>,
    /// FNV-1a over `ids`.
    pub key_hash: u32,
    pub dirty_all: Option<DirtyAllReason>,
}

impl ResolvedDirty {
    pub fn from_ids(mut ids: Vec<FieldPathId>) -> Self {
        ids.sort();
        ids.dedup();
        let raw: Vec<u32> = ids.iter().map(|id| id.0).collect();
        Self {
            key_hash: fnv1a32_ids(&raw),
            ids,
            dirty_all: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirty_all.is_none() && self.ids.is_empty()
    }

    /// Summary for diagnostics, listing at most `top_k` roots.
    pub fn summary(&self, registry: &FieldPathRegistry, top_k: usize) -> DirtySummary {
        DirtySummary {
            dirty_all: self.dirty_all.is_some(),
            reason: self.dirty_all,
            root_count: self.ids.len(),
            key_hash: self.key_hash,
            roots: self
                .ids
                .iter()
                .take(top_k)
                .map(|id| registry.path(*id).to_string())
                .collect(),
        }
    }
}

/// Dirty set as reported in `trait:converge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirtySummary {
    pub dirty_all: bool,
    pub reason: Option<DirtyAllReason>,
    pub root_count: usize,
    pub key_hash: u32,
    pub roots: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn test_insert_keeps_roots_prefix_free() {
        let mut set = DirtySet::new();
        set.insert(p("profile.name"));
        set.insert(p("items"));
        set.insert(p("profile"));
        set.insert(p("profile.age"));
        let roots: Vec<String> = set.roots().iter().map(ToString::to_string).collect();
        assert_eq!(roots, ["items", "profile"]);
    }

    #[test]
    fn test_dirty_all_absorbs_roots() {
        let mut set = DirtySet::from_paths([p("a")]);
        set.mark_all(DirtyAllReason::CustomMutation);
        set.insert(p("b"));
        set.mark_all(DirtyAllReason::UnknownWrite);
        assert_eq!(set.dirty_all(), Some(DirtyAllReason::CustomMutation));
        assert!(set.roots().is_empty());
        assert!(!set.is_empty());
    }

    #[test]
    fn test_resolve_maps_to_registered_ancestors() {
        let registry = FieldPathRegistry::build([p("profile.name"), p("total")].iter());
        let set = DirtySet::from_paths([p("profile.name.first"), p("unrelated"), p("total")]);
        let resolved = set.resolve(&registry);
        let rendered: Vec<String> = resolved
            .ids
            .iter()
            .map(|id| registry.path(*id).to_string())
            .collect();
        assert_eq!(rendered, ["profile.name", "total"]);
        assert_eq!(
            resolved.key_hash,
            ResolvedDirty::from_ids(resolved.ids.clone()).key_hash
        );
    }

    #[test]
    fn test_union() {
        let mut a = DirtySet::from_paths([p("x")]);
        a.union(&DirtySet::from_paths([p("y"), p("x.z")]));
        assert_eq!(a.len(), 2);
        a.union(&DirtySet::all(DirtyAllReason::FallbackPolicy));
        assert_eq!(a.dirty_all(), Some(DirtyAllReason::FallbackPolicy));
    }
}
