//! Field path registry backed by a prefix trie.

use std::collections::BTreeSet;

use converge_foundation::{FieldPath, FieldPathId};
use indexmap::IndexMap;

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: IndexMap<String, usize>,
    id: Option<FieldPathId>,
}

/// Dense ids for every field path a module's steps touch.
///
/// Every registered path also registers all of its prefixes. Ids follow
/// [`FieldPath`] ordering, so an ancestor always has a smaller id than its
/// descendants and the assignment does not depend on declaration order.
#[derive(Debug, Clone)]
pub struct FieldPathRegistry {
    paths: Vec<FieldPath>,
    chains: Vec<Vec<FieldPathId>>,
    nodes: Vec<TrieNode>,
    max_depth: usize,
}

impl FieldPathRegistry {
    /// Register `paths` and all their prefixes.
    pub fn build<'a, I>(paths: I) -> Self
    where
        I: IntoIterator<Item = &'a FieldPath>,
    {
        let mut all = BTreeSet::new();
        for path in paths {
            for len in 1..=path.len() {
                if let Some(prefix) = path.prefix(len) {
                    all.insert(prefix);
                }
            }
        }

        let mut registry = Self {
            paths: Vec::with_capacity(all.len()),
            chains: Vec::with_capacity(all.len()),
            nodes: vec![TrieNode::default()],
            max_depth: 0,
        };

        for path in all {
            let id = FieldPathId::from_index(registry.paths.len());
            let mut node = 0;
            let mut chain = Vec::with_capacity(path.len());
            for segment in path.segments() {
                node = registry.child_or_insert(node, segment);
                if let Some(ancestor) = registry.nodes[node].id {
                    chain.push(ancestor);
                }
            }
            registry.nodes[node].id = Some(id);
            chain.push(id);
            registry.max_depth = registry.max_depth.max(path.len());
            registry.paths.push(path);
            registry.chains.push(chain);
        }
        registry
    }

    fn child_or_insert(&mut self, node: usize, segment: &str) -> usize {
        if let Some(&child) = self.nodes[node].children.get(segment) {
            return child;
        }
        let child = self.nodes.len();
        self.nodes.push(TrieNode::default());
        self.nodes[node].children.insert(segment.to_string(), child);
        child
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Length of the longest registered path.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Id of an exactly registered path.
    pub fn id(&self, path: &FieldPath) -> Option<FieldPathId> {
        let mut node = 0;
        for segment in path.segments() {
            node = *self.nodes[node].children.get(segment)?;
        }
        self.nodes[node].id
    }

    /// Id of `path` or, failing that, of its deepest registered ancestor.
    pub fn resolve(&self, path: &FieldPath) -> Option<FieldPathId> {
        let mut node = 0;
        let mut deepest = None;
        for segment in path.segments() {
            let Some(&child) = self.nodes[node].children.get(segment) else {
                break;
            };
            node = child;
            deepest = self.nodes[node].id.or(deepest);
        }
        deepest
    }

    /// The path behind an id.
    pub fn path(&self, id: FieldPathId) -> &FieldPath {
        &self.paths[id.index()]
    }

    /// Ancestors of `id` from the root down, ending with `id` itself.
    pub fn prefix_chain(&self, id: FieldPathId) -> &[FieldPathId] {
        &self.chains[id.index()]
    }

    /// All paths in id order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldPathId, &FieldPath)> {
        self.paths
            .iter()
            .enumerate()
            .map(|(i, p)| (FieldPathId::from_index(i), p))
    }
}
