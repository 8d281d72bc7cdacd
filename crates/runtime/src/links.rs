//! Declarative links between module instances.
//!
//! A link copies the value at a path of one instance into a path of another
//! whenever the source value changes. The copy is queued as a commit on the
//! target instance, so it is applied and converged by the scheduler like
//! any other change; cascades within one flush are absorbed by the drain
//! rounds, and links that lead back to an instance already settled in the
//! same tick wait for the next tick.

use converge_foundation::{FieldPath, ModuleKey};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::converge::{Patch, PatchReason};
use crate::error::{Error, Result};
use crate::state::{self, StatePath};
use crate::store::{Commit, CommitKind, Origin, Priority};

/// One cross-instance link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceLink {
    pub src: ModuleKey,
    pub src_path: FieldPath,
    pub dst: ModuleKey,
    pub dst_path: FieldPath,
}

impl InstanceLink {
    /// Validate and normalize a link.
    pub fn new(src: ModuleKey, src_path: &str, dst: ModuleKey, dst_path: &str) -> Result<Self> {
        let parse = |raw: &str, role: &str| {
            FieldPath::parse(raw).map_err(|source| Error::InvalidFieldPath {
                raw: raw.to_string(),
                context: format!("link {role}"),
                source,
            })
        };
        let src_path = parse(src_path, "source")?;
        let dst_path = parse(dst_path, "target")?;
        if dst_path.has_wildcard() {
            return Err(Error::WildcardTarget {
                path: dst_path.to_string(),
            });
        }
        if src == dst && src_path.overlaps(&dst_path) {
            return Err(Error::SelfLink {
                path: dst_path.to_string(),
            });
        }
        Ok(Self {
            src,
            src_path,
            dst,
            dst_path,
        })
    }

    /// Commit writing `value` into the target.
    pub(crate) fn commit(&self, value: Value, prev: Option<Value>, priority: Priority) -> Commit {
        let mut commit = Commit::new(
            CommitKind::Link,
            priority,
            Origin::new("link", Some(format!("{}.{}", self.src, self.src_path))),
        );
        if let Some(target) = StatePath::from_field_path(&self.dst_path) {
            commit.writes.push((target, value.clone()));
        }
        commit.dirty.insert(self.dst_path.clone());
        commit.patches.push(Patch {
            path: self.dst_path.to_string(),
            reason: PatchReason::TraitLink,
            prev,
            next: Some(value),
            step: None,
        });
        commit
    }
}

/// A value to copy into a link target.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LinkWrite<'a> {
    pub link: &'a InstanceLink,
    pub value: Value,
}

/// Every link of a runtime.
#[derive(Debug, Default)]
pub(crate) struct LinkTable {
    links: Vec<InstanceLink>,
}

impl LinkTable {
    /// Add a link; returns false if it already exists.
    pub fn add(&mut self, link: InstanceLink) -> bool {
        if self.links.contains(&link) {
            return false;
        }
        self.links.push(link);
        true
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Values to copy after `src` moved from `before` to `after`.
    ///
    /// A source that became absent leaves its targets untouched.
    pub fn propagate<'a>(
        &'a self,
        src: &ModuleKey,
        before: &Value,
        after: &Value,
    ) -> Vec<LinkWrite<'a>> {
        self.links
            .iter()
            .filter(|link| &link.src == src)
            .filter_map(|link| {
                let next = state::read_value(after, &link.src_path)?;
                if state::read_value(before, &link.src_path).as_ref() == Some(&next) {
                    return None;
                }
                trace!(src = %src, path = %link.src_path, dst = %link.dst, "link source changed");
                Some(LinkWrite { link, value: next })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(id: &str) -> ModuleKey {
        ModuleKey::new("m", id)
    }

    #[test]
    fn test_link_validation() {
        assert!(InstanceLink::new(key("a"), "x", key("b"), "y").is_ok());
        assert!(matches!(
            InstanceLink::new(key("a"), "x", key("a"), "x"),
            Err(Error::SelfLink { .. })
        ));
        assert!(matches!(
            InstanceLink::new(key("a"), "x", key("b"), "items[].y"),
            Err(Error::WildcardTarget { .. })
        ));
        assert!(matches!(
            InstanceLink::new(key("a"), "", key("b"), "y"),
            Err(Error::InvalidFieldPath { .. })
        ));
        assert!(InstanceLink::new(key("a"), "x", key("a"), "y").is_ok());
    }

    #[test]
    fn test_propagate_only_changed_sources() {
        let mut table = LinkTable::default();
        assert!(table.add(InstanceLink::new(key("a"), "x", key("b"), "in").unwrap()));
        assert!(!table.add(InstanceLink::new(key("a"), "x", key("b"), "in").unwrap()));
        table.add(InstanceLink::new(key("a"), "y", key("c"), "in").unwrap());
        assert_eq!(table.len(), 2);

        let before = json!({"x": 1, "y": 1});
        let after = json!({"x": 2, "y": 1});
        let writes = table.propagate(&key("a"), &before, &after);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].link.dst, key("b"));
        assert_eq!(writes[0].value, json!(2));

        assert!(table.propagate(&key("a"), &before, &json!({"y": 1})).is_empty());
        assert!(table.propagate(&key("b"), &before, &after).is_empty());
    }

    #[test]
    fn test_link_commit_writes_target() {
        let link = InstanceLink::new(key("a"), "x", key("b"), "inbox.value").unwrap();
        let commit = link.commit(json!(3), None, Priority::Low);
        assert_eq!(commit.kind, CommitKind::Link);
        assert_eq!(commit.priority, Priority::Low);
        assert_eq!(commit.dirty.roots(), &[FieldPath::parse("inbox.value").unwrap()]);
        assert_eq!(commit.patches[0].reason, PatchReason::TraitLink);
        assert_eq!(commit.origin.name.as_deref(), Some("m::a.x"));
    }
}
