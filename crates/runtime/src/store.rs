//! Committed state, queued commits and unit application per module instance.
//!
//! A [`Commit`] is a proposed change to one instance: user writes from a
//! transaction, values copied by a cross-instance link, work handed back by
//! the deferred lane, or work carried over from a capped convergence pass.
//! Commits queue per instance until the scheduler accepts the instance;
//! everything queued is then merged into one unit, applied to a draft of
//! the committed state and converged.
//!
//! # Deferred steps
//!
//! How deferred steps run depends on the resolved policies:
//!
//! | time slicing | lane override | lane task | deferred steps run |
//! |--------------|---------------|-----------|--------------------|
//! | off          | any           | -         | inline, one pass over every step |
//! | on           | `forced_off`  | -         | inline |
//! | on           | `forced_sync` | -         | in a second pass right after the immediate one |
//! | on           | none          | running   | when the lane flushes |
//! | on           | none          | none      | in a second pass (no async runtime) |

use std::collections::{HashSet, VecDeque};

use converge_foundation::{FieldPath, ModuleId, ModuleKey};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::config::{OverrideSet, ResolvedPolicies};
use crate::converge::deferred::{
    DeferredFlush, DeferredLane, FlushFn, LaneEvidence, LaneReason, LaneSettings,
};
use crate::converge::{
    CarriedWork, ConvergeContext, ConvergeExecutor, ConvergeOutcome, ConvergeRequest,
    DegradeReason, DirtySet, Patch,
};
use crate::declaration::ModuleOptions;
use crate::diagnostics::{DiagnosticEvent, Diagnostics, TxnLaneEvent};
use crate::error::{Error, Result};
use crate::ir::{CompiledModule, Scope};
use crate::policy::lane::LaneOverrideMode;
use crate::scheduler::UnitReport;
use crate::state::{self, StatePath};

/// Scheduling priority of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Urgent; applied first in a tick.
    #[default]
    Normal,
    /// Applied when the tick's budget allows.
    Low,
}

/// What produced a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    Transaction,
    DeferredFlush,
    /// Work carried over from a capped pass.
    Carry,
    /// A value copied from another instance.
    Link,
}

/// Origin metadata of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub kind: String,
    pub name: Option<String>,
}

impl Origin {
    pub fn new(kind: impl Into<String>, name: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            name,
        }
    }
}

/// Deferred-scope work travelling with a commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DeferredWork {
    pub dirty: DirtySet,
    pub carried: Option<CarriedWork>,
    pub evidence: LaneEvidence,
}

impl DeferredWork {
    fn merge(&mut self, other: DeferredWork) {
        self.dirty.union(&other.dirty);
        merge_carried(&mut self.carried, other.carried);
        self.evidence.absorb(other.evidence);
    }

    fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.carried.is_none()
    }
}

impl From<DeferredFlush> for DeferredWork {
    fn from(flush: DeferredFlush) -> Self {
        Self {
            dirty: flush.dirty,
            carried: None,
            evidence: flush.evidence,
        }
    }
}

/// A proposed change to one instance.
#[derive(Debug, Clone)]
pub(crate) struct Commit {
    pub op_seq: u64,
    pub kind: CommitKind,
    pub priority: Priority,
    pub origin: Origin,
    /// Whole next state, for untracked mutations.
    pub replace: Option<Value>,
    /// Concrete writes applied after `replace`.
    pub writes: Vec<(StatePath, Value)>,
    pub dirty: DirtySet,
    pub patches: Vec<Patch>,
    pub carried: Option<CarriedWork>,
    pub deferred: Option<DeferredWork>,
}

impl Commit {
    pub fn new(kind: CommitKind, priority: Priority, origin: Origin) -> Self {
        Self {
            op_seq: 0,
            kind,
            priority,
            origin,
            replace: None,
            writes: Vec::new(),
            dirty: DirtySet::new(),
            patches: Vec::new(),
            carried: None,
            deferred: None,
        }
    }

    fn apply_to(&self, target: &mut Value) {
        if let Some(next) = &self.replace {
            *target = next.clone();
        }
        for (path, value) in &self.writes {
            state::write_at(target, path, value.clone());
        }
    }
}

/// Every commit queued for an instance, merged.
#[derive(Debug, Clone)]
pub(crate) struct Unit {
    pub op_seq: u64,
    pub priority: Priority,
    pub kinds: Vec<CommitKind>,
    pub replace: Option<Value>,
    pub writes: Vec<(StatePath, Value)>,
    pub dirty: DirtySet,
    pub patches: Vec<Patch>,
    pub carried: Option<CarriedWork>,
    pub deferred: Option<DeferredWork>,
}

impl Unit {
    /// Merge commits in queue order. A whole-state replacement was built on
    /// top of every earlier commit, so it supersedes their writes.
    pub fn merge(commits: impl IntoIterator<Item = Commit>) -> Option<Self> {
        let mut commits = commits.into_iter();
        let first = commits.next()?;
        let mut unit = Self {
            op_seq: first.op_seq,
            priority: first.priority,
            kinds: vec![first.kind],
            replace: first.replace,
            writes: first.writes,
            dirty: first.dirty,
            patches: first.patches,
            carried: first.carried,
            deferred: first.deferred,
        };
        for commit in commits {
            unit.priority = unit.priority.min(commit.priority);
            if !unit.kinds.contains(&commit.kind) {
                unit.kinds.push(commit.kind);
            }
            if let Some(next) = commit.replace {
                unit.replace = Some(next);
                unit.writes.clear();
            }
            unit.writes.extend(commit.writes);
            unit.dirty.union(&commit.dirty);
            unit.patches.extend(commit.patches);
            merge_carried(&mut unit.carried, commit.carried);
            if let Some(more) = commit.deferred {
                match &mut unit.deferred {
                    Some(work) => work.merge(more),
                    None => unit.deferred = Some(more),
                }
            }
        }
        Some(unit)
    }
}

fn merge_carried(into: &mut Option<CarriedWork>, other: Option<CarriedWork>) {
    let Some(other) = other else {
        return;
    };
    match into {
        Some(work) => work.merge(other),
        None => *into = Some(other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferredMode {
    /// One pass over every step.
    Inline,
    /// A deferred pass right after the immediate one.
    Sync(LaneReason),
    /// Deferred roots go to the lane.
    Lane,
}

/// Bookkeeping while one unit is applied.
struct UnitRun {
    report: UnitReport,
    budget: Option<usize>,
    leftover: DirtySet,
    carried: Option<CarriedWork>,
    deferred: DeferredWork,
}

/// One registered module instance.
#[derive(Debug)]
pub(crate) struct Instance {
    key: ModuleKey,
    options: ModuleOptions,
    provider: Option<OverrideSet>,
    policies: ResolvedPolicies,
    state: Value,
    /// Committed state with every queued write applied.
    pending: Value,
    queue: VecDeque<Commit>,
    txn_seq: u64,
    executor: ConvergeExecutor,
    lane: Option<DeferredLane>,
}

impl Instance {
    pub fn new(
        key: ModuleKey,
        compiled: &CompiledModule,
        options: ModuleOptions,
        policies: ResolvedPolicies,
        initial: Value,
    ) -> Self {
        Self {
            executor: ConvergeExecutor::new(key.clone(), compiled),
            key,
            options,
            provider: None,
            policies,
            pending: initial.clone(),
            state: initial,
            queue: VecDeque::new(),
            txn_seq: 0,
            lane: None,
        }
    }

    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn pending(&self) -> &Value {
        &self.pending
    }

    pub fn txn_seq(&self) -> u64 {
        self.txn_seq
    }

    pub fn policies(&self) -> &ResolvedPolicies {
        &self.policies
    }

    pub fn options(&self) -> &ModuleOptions {
        &self.options
    }

    pub fn provider(&self) -> Option<&OverrideSet> {
        self.provider.as_ref()
    }

    pub fn executor(&self) -> &ConvergeExecutor {
        &self.executor
    }

    /// Switch to newly resolved policies; the caller syncs the lane after.
    pub fn set_policies(&mut self, provider: Option<OverrideSet>, policies: ResolvedPolicies) {
        self.provider = provider;
        self.policies = policies;
    }

    pub fn rebind(&mut self, compiled: &CompiledModule) {
        self.executor.rebind(compiled);
    }

    pub fn has_queue(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Priority of the unit the queued commits would merge into.
    pub fn queued_priority(&self) -> Option<Priority> {
        self.queue.iter().map(|c| c.priority).min()
    }

    pub fn head_op_seq(&self) -> Option<u64> {
        self.queue.front().map(|c| c.op_seq)
    }

    pub fn lane_pending(&self) -> bool {
        self.lane.as_ref().is_some_and(DeferredLane::has_pending)
    }

    fn enqueue(&mut self, commit: Commit) {
        commit.apply_to(&mut self.pending);
        trace!(module = %self.key, kind = ?commit.kind, op_seq = commit.op_seq, "commit queued");
        self.queue.push_back(commit);
    }

    /// Merge and remove every queued commit.
    pub fn take_unit(&mut self) -> Option<Unit> {
        Unit::merge(self.queue.drain(..))
    }

    fn refresh_pending(&mut self) {
        let mut pending = self.state.clone();
        for commit in &self.queue {
            commit.apply_to(&mut pending);
        }
        self.pending = pending;
    }

    fn lane_wanted(&self) -> bool {
        self.policies.converge.value.time_slicing.enabled
            && self.executor.ir().deferred_count() > 0
            && self.policies.lanes.policy.override_mode.is_none()
    }

    fn deferred_mode(&self) -> DeferredMode {
        if !self.policies.converge.value.time_slicing.enabled
            || self.executor.ir().deferred_count() == 0
        {
            return DeferredMode::Inline;
        }
        match self.policies.lanes.policy.override_mode {
            Some(LaneOverrideMode::ForcedOff) => DeferredMode::Inline,
            Some(LaneOverrideMode::ForcedSync) => DeferredMode::Sync(LaneReason::ForcedSync),
            None if self.lane.is_some() => DeferredMode::Lane,
            None => DeferredMode::Sync(LaneReason::Disabled),
        }
    }

    fn lane_settings(&self) -> LaneSettings {
        LaneSettings {
            timing: self.policies.lane_timing().into(),
            allow_coalesce: self.policies.lanes.policy.allow_coalesce,
            capacity: self.policies.concurrency.lossless_backpressure_capacity,
        }
    }

    /// Start, reconfigure or stop the lane to match the policies.
    ///
    /// Stopping a lane with pending work returns that work; the caller
    /// queues it with [`Instance::deferred_commit`] so it replays under the
    /// new mode.
    pub fn sync_lane(
        &mut self,
        handle: Option<&Handle>,
        make_flush: impl FnOnce() -> FlushFn,
    ) -> Option<DeferredFlush> {
        let settings = self.lane_settings();
        let wanted = self.lane_wanted();
        match (&self.lane, handle) {
            (Some(lane), _) if wanted => {
                lane.reconfigure(settings);
                None
            }
            (None, Some(handle)) if wanted => {
                self.lane = Some(DeferredLane::spawn(
                    handle,
                    self.key.clone(),
                    settings,
                    make_flush(),
                ));
                None
            }
            _ => {
                let lane = self.lane.take()?;
                let reason = match self.policies.lanes.policy.override_mode {
                    Some(LaneOverrideMode::ForcedOff) => LaneReason::ForcedOff,
                    Some(LaneOverrideMode::ForcedSync) => LaneReason::ForcedSync,
                    None => LaneReason::Disabled,
                };
                debug!(module = %self.key, ?reason, "deferred lane stopped");
                lane.cancel(reason)
            }
        }
    }

    /// Commit that hands deferred work back to the scheduler.
    ///
    /// With lanes active the flush yields to urgent work; otherwise it is
    /// applied at normal priority.
    pub(crate) fn deferred_commit(&self, mut work: DeferredWork) -> Commit {
        let priority = if self.policies.lanes.lanes_active() {
            Priority::Low
        } else {
            if self.policies.lanes.policy.override_mode.is_none() {
                work.evidence.note(LaneReason::Disabled);
            }
            Priority::Normal
        };
        let mut commit = Commit::new(
            CommitKind::DeferredFlush,
            priority,
            Origin::new("lane", Some("deferred".into())),
        );
        commit.deferred = Some(work);
        commit
    }

    /// Apply a unit to the committed state and converge it.
    ///
    /// `budget` limits the steps every pass of this unit may run together.
    /// Unfinished work is queued again on this instance as follow-up
    /// commits. Returns the report and the state replaced by the new one.
    pub fn apply(
        &mut self,
        unit: Unit,
        diagnostics: &Diagnostics,
        budget: Option<usize>,
    ) -> (UnitReport, Value) {
        self.txn_seq += 1;
        let mode = self.deferred_mode();
        let Unit {
            priority,
            kinds,
            replace,
            writes,
            mut dirty,
            patches,
            mut carried,
            mut deferred,
            ..
        } = unit;

        // Work handed back by a lane that has since been switched off runs
        // with everything else.
        let mut lane_evidence = None;
        if mode == DeferredMode::Inline
            && let Some(work) = deferred.take()
        {
            dirty.union(&work.dirty);
            merge_carried(&mut carried, work.carried);
            diagnostics.emit(DiagnosticEvent::TxnLane(TxnLaneEvent {
                module: self.key.to_string(),
                evidence: work.evidence.clone(),
            }));
            lane_evidence = Some(work.evidence);
        }

        let mut draft = replace.unwrap_or_else(|| self.state.clone());
        for (path, value) in writes {
            state::write_at(&mut draft, &path, value);
        }
        let mut ctx = ConvergeContext::new(draft, self.txn_seq);
        ctx.patches = patches;
        ctx.dirty = dirty.clone();

        let mut run = UnitRun {
            report: UnitReport::new(self.key.clone(), priority, kinds, self.txn_seq),
            budget,
            leftover: DirtySet::new(),
            carried: None,
            deferred: DeferredWork::default(),
        };
        run.report.lane = lane_evidence;

        let scope = match mode {
            DeferredMode::Inline => Scope::All,
            DeferredMode::Sync(_) | DeferredMode::Lane => Scope::Immediate,
        };
        let first = self.pass(&mut ctx, scope, carried.as_ref(), diagnostics, &mut run);

        if mode != DeferredMode::Inline {
            let from_lane = deferred.is_some();
            let mut work = deferred.unwrap_or_default();
            let mut feed = dirty;
            for path in first.iter().flat_map(|o| o.changed.iter()) {
                feed.insert(path.clone());
            }
            if self.executor.affects(Scope::Deferred, &feed) {
                work.dirty.union(&feed);
            }

            if !work.is_empty() {
                let now = match mode {
                    DeferredMode::Sync(reason) => {
                        if from_lane {
                            work.evidence.note(reason);
                        } else {
                            work.evidence = LaneEvidence::bypass(reason);
                        }
                        Some(work)
                    }
                    DeferredMode::Lane if from_lane => Some(work),
                    DeferredMode::Lane => self
                        .lane
                        .as_ref()
                        .and_then(|lane| lane.signal(&work.dirty))
                        .map(DeferredWork::from),
                    DeferredMode::Inline => None,
                };
                if let Some(work) = now {
                    self.run_deferred(&mut ctx, work, diagnostics, &mut run);
                }
            }
        }

        run.report.patches = std::mem::take(&mut ctx.patches);
        run.report.changed = ctx.draft != self.state;
        let previous = std::mem::replace(&mut self.state, ctx.draft);
        self.queue_follow_ups(&mut run);
        self.refresh_pending();

        debug!(
            module = %self.key,
            txn_seq = self.txn_seq,
            steps = run.report.steps,
            stable = run.report.stable,
            "unit applied"
        );
        (run.report, previous)
    }

    fn run_deferred(
        &mut self,
        ctx: &mut ConvergeContext,
        work: DeferredWork,
        diagnostics: &Diagnostics,
        run: &mut UnitRun,
    ) {
        diagnostics.emit(DiagnosticEvent::TxnLane(TxnLaneEvent {
            module: self.key.to_string(),
            evidence: work.evidence.clone(),
        }));
        match run.report.lane.as_mut() {
            Some(evidence) => evidence.absorb(work.evidence),
            None => run.report.lane = Some(work.evidence),
        }

        ctx.dirty = work.dirty;
        let Some(outcome) = self.pass(ctx, Scope::Deferred, work.carried.as_ref(), diagnostics, run)
        else {
            return;
        };

        // Deferred outputs feeding immediate steps settle in this unit; what
        // that feeds back into deferred steps waits for the next flush.
        let feedback = DirtySet::from_paths(outcome.changed.iter().cloned());
        if !self.executor.affects(Scope::Immediate, &feedback) {
            return;
        }
        ctx.dirty = feedback;
        if let Some(back) = self.pass(ctx, Scope::Immediate, None, diagnostics, run) {
            let again = DirtySet::from_paths(back.changed.iter().cloned());
            if self.executor.affects(Scope::Deferred, &again) {
                run.deferred.dirty.union(&again);
            }
        }
    }

    /// One convergence pass within the unit's step budget. Returns `None`
    /// when the budget is spent; the pass's roots are then left over.
    fn pass(
        &mut self,
        ctx: &mut ConvergeContext,
        scope: Scope,
        carried: Option<&CarriedWork>,
        diagnostics: &Diagnostics,
        run: &mut UnitRun,
    ) -> Option<ConvergeOutcome> {
        let mut config = self.policies.converge.value.clone();
        if let Some(remaining) = run.budget {
            if remaining == 0 {
                let left = if scope == Scope::Deferred {
                    run.deferred.dirty.union(&ctx.dirty);
                    &mut run.deferred.carried
                } else {
                    run.leftover.union(&ctx.dirty);
                    &mut run.carried
                };
                merge_carried(left, carried.cloned());
                if !ctx.dirty.is_empty() || carried.is_some() {
                    run.report.degrade(DegradeReason::CycleDetected);
                }
                return None;
            }
            let cap = config.step_cap_for(self.executor.exec().scope_len(scope));
            config.step_cap = Some(cap.min(remaining));
        }

        let outcome = self.executor.converge(
            ctx,
            ConvergeRequest {
                scope,
                config: &config,
                carried,
                diagnostics,
            },
        );

        run.report.passes += 1;
        run.report.steps += outcome.executed_steps;
        if let Some(remaining) = run.budget.as_mut() {
            *remaining = remaining.saturating_sub(outcome.executed_steps);
        }
        if let Some(reason) = outcome.degrade {
            run.report.degrade(reason);
        }
        if let Some(work) = outcome.carried.clone() {
            if scope == Scope::Deferred {
                merge_carried(&mut run.deferred.carried, Some(work));
            } else {
                merge_carried(&mut run.carried, Some(work));
            }
        }
        Some(outcome)
    }

    fn queue_follow_ups(&mut self, run: &mut UnitRun) {
        if run.carried.is_some() || !run.leftover.is_empty() {
            let mut commit = Commit::new(
                CommitKind::Carry,
                run.report.priority,
                Origin::new("carry", None),
            );
            commit.dirty = std::mem::take(&mut run.leftover);
            commit.carried = run.carried.take();
            self.queue.push_back(commit);
        }

        let work = std::mem::take(&mut run.deferred);
        if !work.is_empty() {
            let pending = match self.lane.as_ref() {
                Some(lane) if work.carried.is_none() => lane.signal(&work.dirty).map(DeferredWork::from),
                _ => Some(work),
            };
            if let Some(work) = pending {
                let commit = self.deferred_commit(work);
                self.queue.push_back(commit);
            }
        }
    }
}

/// Every instance of a runtime, in registration order.
#[derive(Debug, Default)]
pub(crate) struct Store {
    instances: IndexMap<ModuleKey, Instance>,
    op_seq: u64,
}

impl Store {
    pub fn insert(&mut self, instance: Instance) -> Result<()> {
        if self.instances.contains_key(instance.key()) {
            return Err(Error::DuplicateInstance(instance.key().clone()));
        }
        self.instances.insert(instance.key().clone(), instance);
        Ok(())
    }

    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.instances.contains_key(key)
    }

    pub fn get(&self, key: &ModuleKey) -> Result<&Instance> {
        self.instances
            .get(key)
            .ok_or_else(|| Error::UnknownInstance(key.clone()))
    }

    pub fn get_mut(&mut self, key: &ModuleKey) -> Result<&mut Instance> {
        self.instances
            .get_mut(key)
            .ok_or_else(|| Error::UnknownInstance(key.clone()))
    }

    pub fn instances_of<'a>(
        &'a mut self,
        module: &'a ModuleId,
    ) -> impl Iterator<Item = &'a mut Instance> + 'a {
        self.instances
            .values_mut()
            .filter(move |i| &i.key().module_id == module)
    }

    /// Queue a commit, assigning the next operation sequence number.
    pub fn enqueue(&mut self, key: &ModuleKey, mut commit: Commit) -> Result<u64> {
        let instance = self
            .instances
            .get_mut(key)
            .ok_or_else(|| Error::UnknownInstance(key.clone()))?;
        self.op_seq += 1;
        commit.op_seq = self.op_seq;
        instance.enqueue(commit);
        Ok(self.op_seq)
    }

    /// Instances with queued commits, as (urgent, non-urgent) counts.
    pub fn backlog(&self) -> (usize, usize) {
        self.instances
            .values()
            .filter_map(Instance::queued_priority)
            .fold((0, 0), |(urgent, low), p| match p {
                Priority::Normal => (urgent + 1, low),
                Priority::Low => (urgent, low + 1),
            })
    }

    /// Instances with queued commits that are not in `skip`, urgent first,
    /// each group in enqueue order.
    pub fn ready(&self, skip: &HashSet<ModuleKey>) -> Vec<(ModuleKey, Priority)> {
        let mut ready: Vec<(Priority, u64, &ModuleKey)> = self
            .instances
            .values()
            .filter(|i| !skip.contains(i.key()))
            .filter_map(|i| Some((i.queued_priority()?, i.head_op_seq()?, i.key())))
            .collect();
        ready.sort();
        ready
            .into_iter()
            .map(|(priority, _, key)| (key.clone(), priority))
            .collect()
    }

    /// Keys in `keys` that have commits queued again.
    pub fn requeued<'a>(&self, keys: impl IntoIterator<Item = &'a ModuleKey>) -> Vec<ModuleKey> {
        keys.into_iter()
            .filter(|k| self.instances.get(*k).is_some_and(Instance::has_queue))
            .cloned()
            .collect()
    }

    /// Read a field of an instance's committed state.
    pub fn read(&self, key: &ModuleKey, path: &FieldPath) -> Result<Option<Value>> {
        Ok(state::read_value(self.get(key)?.state(), path))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::{ConvergeConfigPatch, RuntimeConfig, TimeSlicingPatch};
    use crate::converge::PatchReason;
    use crate::declaration::{DeclarationGroup, FieldEntry, ModuleDeclaration};
    use crate::diagnostics::{DiagnosticsConfig, DiagnosticsLevel, MemorySink};
    use crate::ir::IrCache;
    use crate::policy::lane::LanePolicyPatch;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    fn instance(decl: &ModuleDeclaration, initial: Value) -> Instance {
        let compiled = IrCache::new().get_or_compile(decl).unwrap();
        let key = ModuleKey::new(decl.module_id().clone(), "i1");
        let policies = ResolvedPolicies::resolve(
            &RuntimeConfig::default(),
            decl.module_id(),
            decl.module_options(),
            None,
        );
        Instance::new(key, &compiled, decl.module_options().clone(), policies, initial)
    }

    fn write(path: &str, value: Value) -> Commit {
        let mut commit = Commit::new(
            CommitKind::Transaction,
            Priority::Normal,
            Origin::new("action", Some("set".into())),
        );
        commit
            .writes
            .push((StatePath::parse(path).unwrap(), value.clone()));
        commit.dirty.insert(p(path));
        commit.patches.push(Patch {
            path: path.into(),
            reason: PatchReason::Reducer,
            prev: None,
            next: Some(value),
            step: None,
        });
        commit
    }

    fn search_module(sync: bool) -> ModuleDeclaration {
        let mut options = ModuleOptions {
            converge: ConvergeConfigPatch {
                time_slicing: Some(TimeSlicingPatch {
                    enabled: Some(true),
                    ..TimeSlicingPatch::default()
                }),
                ..ConvergeConfigPatch::default()
            },
            ..ModuleOptions::default()
        };
        if sync {
            options.lanes = LanePolicyPatch {
                override_mode: Some(LaneOverrideMode::ForcedSync),
                ..LanePolicyPatch::default()
            };
        }
        ModuleDeclaration::new("search")
            .group(
                DeclarationGroup::new("derived")
                    .field(
                        "echo",
                        FieldEntry::computed(["query"], |s| Ok(s.get("query"))),
                    )
                    .field(
                        "length",
                        FieldEntry::computed(["query"], |s| {
                            Ok(json!(s.string("query").len()))
                        })
                        .deferred(),
                    ),
            )
            .options(options)
    }

    #[test]
    fn test_unit_merge_keeps_queue_order() {
        let mut replaced = Commit::new(
            CommitKind::Transaction,
            Priority::Low,
            Origin::new("action", None),
        );
        replaced.replace = Some(json!({"a": 1}));
        replaced.dirty.mark_all(crate::converge::DirtyAllReason::CustomMutation);

        let unit = Unit::merge([write("b", json!(2)), replaced, write("c", json!(3))]).unwrap();
        assert_eq!(unit.priority, Priority::Normal);
        assert_eq!(unit.kinds, vec![CommitKind::Transaction]);
        assert_eq!(unit.replace, Some(json!({"a": 1})));
        assert_eq!(unit.writes.len(), 1);
        assert!(unit.dirty.dirty_all().is_some());
        assert_eq!(unit.patches.len(), 2);
    }

    #[test]
    fn test_pending_reflects_queued_writes() {
        let decl = ModuleDeclaration::new("plain");
        let mut store = Store::default();
        store.insert(instance(&decl, json!({"a": 0}))).unwrap();
        let key = ModuleKey::new("plain", "i1");

        let seq = store.enqueue(&key, write("a", json!(1))).unwrap();
        assert_eq!(seq, 1);
        let inst = store.get(&key).unwrap();
        assert_eq!(inst.pending(), &json!({"a": 1}));
        assert_eq!(inst.state(), &json!({"a": 0}));
        assert_eq!(store.backlog(), (1, 0));
        assert!(matches!(
            store.enqueue(&ModuleKey::new("plain", "missing"), write("a", json!(2))),
            Err(Error::UnknownInstance(_))
        ));
    }

    #[test]
    fn test_ready_orders_urgent_first_then_by_sequence() {
        let decl = ModuleDeclaration::new("plain");
        let mut store = Store::default();
        for id in ["x", "y", "z"] {
            let mut inst = instance(&decl, json!({}));
            inst.key = ModuleKey::new("plain", id);
            store.insert(inst).unwrap();
        }
        let (x, y, z) = (
            ModuleKey::new("plain", "x"),
            ModuleKey::new("plain", "y"),
            ModuleKey::new("plain", "z"),
        );
        let mut low = write("a", json!(1));
        low.priority = Priority::Low;
        store.enqueue(&x, low).unwrap();
        store.enqueue(&y, write("a", json!(1))).unwrap();
        store.enqueue(&z, write("a", json!(1))).unwrap();

        let order: Vec<_> = store.ready(&HashSet::new()).into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec![y.clone(), z.clone(), x.clone()]);
        let skip = HashSet::from([y]);
        assert_eq!(store.ready(&skip).len(), 2);
    }

    #[test]
    fn test_apply_runs_deferred_inline_without_time_slicing() {
        let decl = search_module(false).options(ModuleOptions::default());
        let mut inst = instance(&decl, json!({"query": ""}));
        inst.enqueue(write("query", json!("abc")));

        let unit = inst.take_unit().unwrap();
        let (report, previous) = inst.apply(unit, &Diagnostics::disabled(), None);
        assert_eq!(previous, json!({"query": ""}));
        assert_eq!(report.passes, 1);
        assert!(report.stable && report.changed);
        assert_eq!(inst.state()["echo"], json!("abc"));
        assert_eq!(inst.state()["length"], json!(3));
        assert!(!inst.has_queue());
    }

    #[test]
    fn test_forced_sync_runs_deferred_pass_with_evidence() {
        let sink = Arc::new(MemorySink::new());
        let diagnostics = Diagnostics::new(
            DiagnosticsConfig {
                level: DiagnosticsLevel::Light,
                ..DiagnosticsConfig::default()
            },
            sink.clone(),
        );
        let mut inst = instance(&search_module(true), json!({"query": ""}));
        assert_eq!(inst.sync_lane(None, || unreachable!()), None);
        inst.enqueue(write("query", json!("hello")));

        let unit = inst.take_unit().unwrap();
        let (report, _) = inst.apply(unit, &diagnostics, None);
        assert_eq!(report.passes, 2);
        assert_eq!(inst.state()["length"], json!(5));
        let evidence = report.lane.unwrap();
        assert_eq!(evidence.reasons, vec![LaneReason::ForcedSync]);
        assert_eq!(sink.of_kind("trace:txn-lane").len(), 1);
    }

    #[test]
    fn test_spent_budget_queues_deferred_follow_up() {
        let mut inst = instance(&search_module(true), json!({"query": ""}));
        inst.enqueue(write("query", json!("hi")));

        let unit = inst.take_unit().unwrap();
        let (report, _) = inst.apply(unit, &Diagnostics::disabled(), Some(1));
        assert_eq!(report.steps, 1);
        assert!(!report.stable);
        assert_eq!(report.degrade_reason, Some(DegradeReason::CycleDetected));
        assert_eq!(inst.state()["echo"], json!("hi"));
        assert!(inst.state().get("length").is_none());
        assert_eq!(inst.queue_len(), 1);
        assert_eq!(inst.queue[0].kind, CommitKind::DeferredFlush);

        let unit = inst.take_unit().unwrap();
        let (report, _) = inst.apply(unit, &Diagnostics::disabled(), None);
        assert!(report.stable);
        assert_eq!(inst.state()["length"], json!(2));
    }
}
