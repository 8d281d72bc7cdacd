//! LRU cache of computed plans for one module instance.

use std::sync::Arc;

use converge_foundation::{FieldPathId, StepId};
use indexmap::IndexMap;
use serde::Serialize;

use crate::ir::Scope;

use super::dirty::ResolvedDirty;

const DEFAULT_CAPACITY: usize = 128;

/// Generation changes after which a cache that never paid off is disabled.
const THRASH_GENERATIONS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    scope: Scope,
    key_hash: u32,
    roots: Vec<FieldPathId>,
}

/// Hit/miss evidence reported in decision summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub disabled: bool,
}

/// Plans keyed by scope and canonical dirty roots, valid for one IR
/// generation.
#[derive(Debug)]
pub struct PlanCache {
    generation: u64,
    capacity: usize,
    entries: IndexMap<PlanKey, Arc<[StepId]>>,
    stats: PlanCacheStats,
    generation_bumps: u32,
}

impl PlanCache {
    pub fn new(generation: u64) -> Self {
        Self::with_capacity(generation, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(generation: u64, capacity: usize) -> Self {
        Self {
            generation,
            capacity: capacity.max(1),
            entries: IndexMap::new(),
            stats: PlanCacheStats::default(),
            generation_bumps: 0,
        }
    }

    /// Drop every entry when the IR generation moved.
    pub fn sync_generation(&mut self, generation: u64) {
        if generation == self.generation {
            return;
        }
        self.generation = generation;
        self.entries.clear();
        self.generation_bumps += 1;
        if self.generation_bumps >= THRASH_GENERATIONS && self.stats.hits < self.stats.misses {
            self.stats.disabled = true;
        }
    }

    pub fn get(&mut self, scope: Scope, dirty: &ResolvedDirty) -> Option<Arc<[StepId]>> {
        if self.stats.disabled {
            return None;
        }
        let key = PlanKey {
            scope,
            key_hash: dirty.key_hash,
            roots: dirty.ids.clone(),
        };
        match self.entries.get_index_of(&key) {
            Some(index) => {
                self.stats.hits += 1;
                let last = self.entries.len() - 1;
                self.entries.move_index(index, last);
                self.entries.get_index(last).map(|(_, plan)| plan.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, scope: Scope, dirty: &ResolvedDirty, plan: &[StepId]) {
        if self.stats.disabled {
            return;
        }
        let key = PlanKey {
            scope,
            key_hash: dirty.key_hash,
            roots: dirty.ids.clone(),
        };
        self.entries.insert(key, plan.into());
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
            self.stats.evictions += 1;
        }
    }

    pub fn stats(&self) -> PlanCacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
