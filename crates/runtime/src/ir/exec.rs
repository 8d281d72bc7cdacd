//! Dense execution projection of a [`StaticIr`].
//!
//! Every table is an offset + payload pair (CSR layout) indexed by
//! [`FieldPathId`] or [`StepId`]. The projection itself is immutable and
//! shared; all per-pass mutable state lives in an [`ExecScratch`] owned by
//! one module instance and reset by a sweep between uses.

use std::time::Instant;

use converge_foundation::{FieldPathId, StepId};

use crate::declaration::Scheduling;

use super::types::{Scope, StaticIr};

/// Below this many steps (and without cycles) plans are computed by a linear
/// scan of the topological order.
pub const SMALL_GRAPH_STEPS: usize = 32;

/// Plan closure checks its deadline once per this many popped ids.
const DEADLINE_CHECK_INTERVAL: usize = 32;

/// Rows of `u32` stored as offsets into one payload array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Csr {
    offsets: Vec<u32>,
    items: Vec<u32>,
}

impl Csr {
    fn from_rows<R, I>(rows: R) -> Self
    where
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = u32>,
    {
        let mut offsets = vec![0];
        let mut items = Vec::new();
        for row in rows {
            items.extend(row);
            offsets.push(items.len() as u32);
        }
        Self { offsets, items }
    }

    /// Items of row `i`.
    #[inline]
    pub fn row(&self, i: usize) -> &[u32] {
        let start = self.offsets[i] as usize;
        let end = self.offsets[i + 1] as usize;
        &self.items[start..end]
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.offsets.len() - 1
    }
}

/// Fixed-size dense bitset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    /// Sets bit `i`, returning whether it was previously clear.
    #[inline]
    pub fn insert(&mut self, i: usize) -> bool {
        let fresh = !self.get(i);
        self.set(i);
        fresh
    }

    /// O(size) sweep.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Indexes of set bits in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(w * 64 + tz)
            })
        })
    }
}

/// Result of a plan computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    /// `ExecScratch::plan` holds the reachable steps in topological order.
    Planned,
    /// The decision budget ran out; the caller should run the full scope.
    Cutoff,
}

/// Per-instance mutable buffers sized for one [`ExecIr`].
#[derive(Debug, Clone)]
pub struct ExecScratch {
    pub(crate) dirty_root: BitSet,
    pub(crate) dirty_prefix: BitSet,
    seed_root: BitSet,
    seed_prefix: BitSet,
    reachable: BitSet,
    queue: Vec<u32>,
    pub(crate) plan: Vec<StepId>,
    generation: u64,
}

impl ExecScratch {
    /// Steps of the last computed plan.
    pub fn plan(&self) -> &[StepId] {
        &self.plan
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Array-based reachability index over one static IR generation.
#[derive(Debug, Clone)]
pub struct ExecIr {
    generation: u64,
    path_count: usize,
    shallow: bool,
    chains: Csr,
    exact: Csr,
    under: Csr,
    inputs: Csr,
    outs: Vec<u32>,
    deferred: Vec<bool>,
    topo: [Vec<u32>; 3],
    positions: [Vec<u32>; 3],
    back_edges: [bool; 3],
}

const NOT_IN_SCOPE: u32 = u32::MAX;

impl ExecIr {
    /// Project a static IR into dense tables.
    pub fn new(ir: &StaticIr) -> Self {
        let registry = ir.registry();
        let steps = ir.steps();

        let chains = Csr::from_rows(
            registry
                .iter()
                .map(|(id, _)| registry.prefix_chain(id).iter().map(|p| p.0)),
        );
        let triggers = ir.triggers();
        let exact = Csr::from_rows(triggers.exact.iter().map(|row| row.iter().map(|s| s.0)));
        let under = Csr::from_rows(triggers.under.iter().map(|row| row.iter().map(|s| s.0)));
        let inputs = Csr::from_rows(steps.iter().map(|s| {
            let mut ids: Vec<u32> = s.deps.iter().map(|d| d.0).collect();
            ids.push(s.out.0);
            ids.sort_unstable();
            ids.dedup();
            ids
        }));

        let mut topo: [Vec<u32>; 3] = Default::default();
        let mut positions: [Vec<u32>; 3] = Default::default();
        let mut back_edges = [false; 3];
        for scope in Scope::ALL {
            let order = ir.order(scope);
            let i = scope.index();
            topo[i] = order.order.iter().map(|s| s.0).collect();
            positions[i] = vec![NOT_IN_SCOPE; steps.len()];
            for (pos, step) in order.order.iter().enumerate() {
                positions[i][step.index()] = pos as u32;
            }
            back_edges[i] = order.has_back_edges();
        }

        Self {
            generation: ir.generation(),
            path_count: registry.len(),
            shallow: registry.max_depth() <= 1,
            chains,
            exact,
            under,
            inputs,
            outs: steps.iter().map(|s| s.out.0).collect(),
            deferred: steps
                .iter()
                .map(|s| s.scheduling == Scheduling::Deferred)
                .collect(),
            topo,
            positions,
            back_edges,
        }
    }

    /// Fresh scratch buffers for this projection.
    pub fn scratch(&self) -> ExecScratch {
        ExecScratch {
            dirty_root: BitSet::new(self.path_count),
            dirty_prefix: BitSet::new(self.path_count),
            seed_root: BitSet::new(self.path_count),
            seed_prefix: BitSet::new(self.path_count),
            reachable: BitSet::new(self.outs.len()),
            queue: Vec::with_capacity(self.path_count),
            plan: Vec::with_capacity(self.outs.len()),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether every registered path has a single segment.
    pub fn is_shallow(&self) -> bool {
        self.shallow
    }

    pub fn step_count(&self) -> usize {
        self.outs.len()
    }

    /// Steps of `scope` in topological order.
    pub fn topo(&self, scope: Scope) -> impl ExactSizeIterator<Item = StepId> + '_ {
        self.topo[scope.index()].iter().map(|&s| StepId(s))
    }

    pub fn scope_len(&self, scope: Scope) -> usize {
        self.topo[scope.index()].len()
    }

    /// Position of `step` in the topological order of `scope`.
    #[inline]
    pub fn position(&self, scope: Scope, step: StepId) -> Option<usize> {
        let pos = self.positions[scope.index()][step.index()];
        (pos != NOT_IN_SCOPE).then_some(pos as usize)
    }

    pub fn is_deferred(&self, step: StepId) -> bool {
        self.deferred[step.index()]
    }

    pub fn out(&self, step: StepId) -> FieldPathId {
        FieldPathId(self.outs[step.index()])
    }

    /// Ancestors of `id` ending with `id`.
    pub fn prefix_chain(&self, id: FieldPathId) -> &[u32] {
        self.chains.row(id.index())
    }

    /// Visit every step whose dependency or output overlaps `id`.
    ///
    /// A step may be visited more than once.
    #[inline]
    pub fn for_each_affected(&self, id: FieldPathId, mut visit: impl FnMut(StepId)) {
        for &prefix in self.chains.row(id.index()) {
            for &step in self.exact.row(prefix as usize) {
                visit(StepId(step));
            }
        }
        for &step in self.under.row(id.index()) {
            visit(StepId(step));
        }
    }

    /// Whether a change of `id` affects a step of `scope`.
    pub fn affects_scope(&self, scope: Scope, id: FieldPathId) -> bool {
        let mut hit = false;
        self.for_each_affected(id, |step| hit |= self.position(scope, step).is_some());
        hit
    }

    /// Whether a change of `id` written by `step` affects another step that
    /// comes earlier in the topological order of `scope`.
    pub fn affects_earlier(&self, scope: Scope, id: FieldPathId, step: StepId) -> bool {
        let Some(current) = self.position(scope, step) else {
            return false;
        };
        let mut hit = false;
        self.for_each_affected(id, |other| {
            if other != step
                && let Some(pos) = self.position(scope, other)
            {
                hit |= pos < current;
            }
        });
        hit
    }

    /// Clear the dirty bitsets.
    pub fn reset_dirty(&self, scratch: &mut ExecScratch) {
        scratch.dirty_root.clear();
        scratch.dirty_prefix.clear();
    }

    /// Record `id` as changed.
    #[inline]
    pub fn mark_dirty(&self, scratch: &mut ExecScratch, id: FieldPathId) {
        mark(
            self,
            &mut scratch.dirty_root,
            &mut scratch.dirty_prefix,
            id,
        );
    }

    /// Whether any input of `step` overlaps a dirty path.
    #[inline]
    pub fn should_run(&self, scratch: &ExecScratch, step: StepId) -> bool {
        touched(
            self,
            &scratch.dirty_root,
            &scratch.dirty_prefix,
            self.inputs.row(step.index()),
        )
    }

    /// Compute the steps of `scope` reachable from `roots` and `forced`.
    ///
    /// The result is left in [`ExecScratch::plan`] in topological order.
    pub fn compute_plan(
        &self,
        scratch: &mut ExecScratch,
        scope: Scope,
        roots: &[FieldPathId],
        forced: &[StepId],
        deadline: Option<Instant>,
    ) -> PlanOutcome {
        scratch.plan.clear();
        scratch.reachable.clear();
        scratch.seed_root.clear();
        scratch.seed_prefix.clear();

        let scope_len = self.scope_len(scope);
        if scope_len < SMALL_GRAPH_STEPS && !self.back_edges[scope.index()] {
            self.linear_plan(scratch, scope, roots, forced);
            return PlanOutcome::Planned;
        }

        scratch.queue.clear();
        scratch.queue.extend(roots.iter().map(|r| r.0));
        let mut reached: Vec<u32> = Vec::new();
        for &step in forced {
            if self.position(scope, step).is_some() && scratch.reachable.insert(step.index()) {
                reached.push(step.0);
                scratch.queue.push(self.outs[step.index()]);
            }
        }

        let mut popped = 0usize;
        while let Some(id) = scratch.queue.pop() {
            popped += 1;
            if popped % DEADLINE_CHECK_INTERVAL == 0
                && let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return PlanOutcome::Cutoff;
            }

            let reachable = &mut scratch.reachable;
            let queue = &mut scratch.queue;
            self.for_each_affected(FieldPathId(id), |step| {
                if self.position(scope, step).is_some() && reachable.insert(step.index()) {
                    reached.push(step.0);
                    queue.push(self.outs[step.index()]);
                }
            });
        }

        let positions = &self.positions[scope.index()];
        if reached.len().saturating_mul(8) < scope_len {
            reached.sort_unstable_by_key(|s| positions[*s as usize]);
            scratch.plan.extend(reached.into_iter().map(StepId));
        } else {
            let reachable = &scratch.reachable;
            scratch.plan.extend(
                self.topo[scope.index()]
                    .iter()
                    .filter(|s| reachable.get(**s as usize))
                    .map(|&s| StepId(s)),
            );
        }
        PlanOutcome::Planned
    }

    /// Plan by repeated scans of an acyclic small scope.
    fn linear_plan(
        &self,
        scratch: &mut ExecScratch,
        scope: Scope,
        roots: &[FieldPathId],
        forced: &[StepId],
    ) {
        for &root in roots {
            mark(self, &mut scratch.seed_root, &mut scratch.seed_prefix, root);
        }
        for &step in forced {
            if self.position(scope, step).is_some() {
                scratch.reachable.set(step.index());
                let out = self.out(step);
                mark(self, &mut scratch.seed_root, &mut scratch.seed_prefix, out);
            }
        }

        // A second scan only finds steps whose output overlaps a later
        // step's output; it usually adds nothing.
        loop {
            let mut added = false;
            for &step in &self.topo[scope.index()] {
                let index = step as usize;
                if scratch.reachable.get(index) {
                    continue;
                }
                if touched(
                    self,
                    &scratch.seed_root,
                    &scratch.seed_prefix,
                    self.inputs.row(index),
                ) {
                    scratch.reachable.set(index);
                    let out = FieldPathId(self.outs[index]);
                    mark(self, &mut scratch.seed_root, &mut scratch.seed_prefix, out);
                    added = true;
                }
            }
            if !added {
                break;
            }
        }

        let reachable = &scratch.reachable;
        scratch.plan.extend(
            self.topo[scope.index()]
                .iter()
                .filter(|s| reachable.get(**s as usize))
                .map(|&s| StepId(s)),
        );
    }
}

#[inline]
fn mark(exec: &ExecIr, roots: &mut BitSet, prefixes: &mut BitSet, id: FieldPathId) {
    roots.set(id.index());
    if exec.shallow {
        prefixes.set(id.index());
        return;
    }
    for &prefix in exec.chains.row(id.index()) {
        prefixes.set(prefix as usize);
    }
}

/// Whether any of `inputs` overlaps a marked path: the input is an ancestor
/// of a marked path, or a marked path is an ancestor of the input.
#[inline]
fn touched(exec: &ExecIr, roots: &BitSet, prefixes: &BitSet, inputs: &[u32]) -> bool {
    if exec.shallow {
        return inputs.iter().any(|&x| roots.get(x as usize));
    }
    inputs.iter().any(|&x| {
        prefixes.get(x as usize) || exec.chains.row(x as usize).iter().any(|&p| roots.get(p as usize))
    })
}
