//! Convergence executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_foundation::{FieldPath, FieldPathId, ModuleKey, StepId};
use tracing::{debug, instrument, trace, warn};

use crate::config::{ConvergeConfig, ConvergeMode};
use crate::declaration::DepsDiff;
use crate::diagnostics::{DepsMismatchEvent, Detail, DiagnosticEvent, Diagnostics};
use crate::error::DeriveError;
use crate::ir::{CompiledModule, ExecIr, ExecScratch, PlanOutcome, Scope, SharedIr, StaticIr, StepKind};
use crate::state;

use super::context::{ConvergeContext, Patch, PatchReason};
use super::dirty::{DirtySet, ResolvedDirty};
use super::plan_cache::{PlanCache, PlanCacheStats};
use super::step;
use super::{
    CarriedWork, ConvergeOutcome, DecisionReason, DecisionSummary, DegradeReason, ExecutedMode,
    StepTiming,
};

/// The time budget is checked once per this many executed steps.
const BUDGET_CHECK_INTERVAL: usize = 32;

/// A plan covering at least this share of the scope runs as a full pass.
const PLAN_NEAR_FULL_RATIO: f64 = 0.9;

/// Dirty-root ratio above which `auto` skips planning.
fn near_full_threshold(scope_len: usize) -> f64 {
    match scope_len {
        n if n >= 1536 => 0.65,
        n if n >= 1024 => 0.7,
        n if n >= 512 => 0.75,
        _ => 0.9,
    }
}

/// Inputs of one convergence pass besides the context.
#[derive(Debug, Clone, Copy)]
pub struct ConvergeRequest<'a> {
    pub scope: Scope,
    pub config: &'a ConvergeConfig,
    /// Work carried over from a capped pass.
    pub carried: Option<&'a CarriedWork>,
    pub diagnostics: &'a Diagnostics,
}

/// Runs convergence passes for one module instance.
///
/// Owns the instance's scratch buffers and plan cache; the compiled IR is
/// shared with every other instance of the module.
#[derive(Debug)]
pub struct ConvergeExecutor {
    key: ModuleKey,
    ir: SharedIr,
    exec: Arc<ExecIr>,
    scratch: ExecScratch,
    plan_cache: PlanCache,
}

enum Stop {
    Cap(DegradeReason, usize),
    Failed(StepId, DeriveError),
}

impl ConvergeExecutor {
    pub fn new(key: ModuleKey, compiled: &CompiledModule) -> Self {
        Self {
            key,
            ir: compiled.ir.clone(),
            scratch: compiled.exec.scratch(),
            exec: compiled.exec.clone(),
            plan_cache: PlanCache::new(compiled.ir.generation()),
        }
    }

    /// Switch to a recompiled IR; scratch and cached plans of older
    /// generations are dropped.
    pub fn rebind(&mut self, compiled: &CompiledModule) {
        if compiled.ir.generation() == self.ir.generation() && Arc::ptr_eq(&compiled.ir, &self.ir) {
            return;
        }
        debug!(
            module = %self.key,
            from = self.ir.generation(),
            to = compiled.ir.generation(),
            "executor rebound"
        );
        self.ir = compiled.ir.clone();
        self.exec = compiled.exec.clone();
        self.scratch = self.exec.scratch();
        self.plan_cache.sync_generation(compiled.ir.generation());
    }

    pub fn ir(&self) -> &SharedIr {
        &self.ir
    }

    pub fn exec(&self) -> &ExecIr {
        &self.exec
    }

    pub fn plan_cache_stats(&self) -> PlanCacheStats {
        self.plan_cache.stats()
    }

    /// Whether any root of `dirty` can trigger a step of `scope`.
    pub fn affects(&self, scope: Scope, dirty: &DirtySet) -> bool {
        if self.exec.scope_len(scope) == 0 || dirty.is_empty() {
            return false;
        }
        let resolved = dirty.resolve(self.ir.registry());
        resolved.dirty_all.is_some()
            || resolved
                .ids
                .iter()
                .any(|&id| self.exec.affects_scope(scope, id))
    }

    /// Run one pass over `request.scope` for the dirty roots in `ctx`.
    #[instrument(skip_all, name = "converge", fields(module = %self.key, txn_seq = ctx.txn_seq, scope = ?request.scope))]
    pub fn converge(
        &mut self,
        ctx: &mut ConvergeContext,
        request: ConvergeRequest<'_>,
    ) -> ConvergeOutcome {
        let started = Instant::now();
        let ConvergeRequest {
            scope,
            config,
            carried,
            diagnostics,
        } = request;
        let ir = self.ir.clone();
        let exec = self.exec.clone();
        let registry = ir.registry();
        let detail = diagnostics.detail_for(ctx.txn_seq);
        let scope_len = exec.scope_len(scope);

        let mut dirty = ctx.dirty.clone();
        let mut forced: Vec<StepId> = Vec::new();
        if let Some(carried) = carried {
            for root in &carried.dirty_roots {
                dirty.insert(root.clone());
            }
            forced.extend(
                carried
                    .forced_outs
                    .iter()
                    .filter_map(|out| registry.id(out))
                    .filter_map(|id| ir.step_for_out(id))
                    .filter(|s| exec.position(scope, *s).is_some()),
            );
        }
        let resolved = dirty.resolve(registry);

        let mut summary = DecisionSummary::new(
            &self.key,
            ctx.txn_seq,
            scope,
            config.mode,
            resolved.summary(registry, diagnostics.config().top_k),
        );
        summary.step_count = scope_len;
        if carried.is_some() {
            summary.reasons.push(DecisionReason::Carried);
        }

        if scope_len == 0 || (resolved.is_empty() && forced.is_empty()) {
            trace!("nothing to converge");
            return self.finish(summary, Vec::new(), None, started, detail, diagnostics);
        }

        let decision_started = Instant::now();
        let (mode, steps) = self.decide(ctx.txn_seq, scope, config, &resolved, &forced, &mut summary);
        summary.decision_ms = ms(decision_started.elapsed());
        summary.executed_mode = mode;
        summary.plan_len = steps.len();

        // Seed dirty marks.
        exec.reset_dirty(&mut self.scratch);
        for &id in &resolved.ids {
            exec.mark_dirty(&mut self.scratch, id);
        }
        for &s in &forced {
            exec.mark_dirty(&mut self.scratch, exec.out(s));
        }

        let snapshot = ctx.draft.clone();
        let patch_mark = ctx.patches.len();
        let cap = config.step_cap_for(scope_len);
        let deadline = started + config.budget();
        let trace_steps = detail == Detail::Steps;

        let mut round = steps;
        let mut unconditional = mode == ExecutedMode::Full;
        let mut next_roots: Vec<FieldPathId> = Vec::new();
        let mut changed: Vec<FieldPathId> = Vec::new();
        let mut timings: Vec<(StepId, Duration)> = Vec::new();
        let mut executed = 0usize;
        let mut stop = None;
        summary.rounds = 1;

        'pass: loop {
            next_roots.clear();
            for (i, &s) in round.iter().enumerate() {
                if !unconditional && !exec.should_run(&self.scratch, s) {
                    continue;
                }
                if executed >= cap {
                    stop = Some(Stop::Cap(DegradeReason::CycleDetected, i));
                    break 'pass;
                }
                if executed > 0
                    && executed % BUDGET_CHECK_INTERVAL == 0
                    && Instant::now() >= deadline
                {
                    stop = Some(Stop::Cap(DegradeReason::BudgetSteps, i));
                    break 'pass;
                }
                executed += 1;

                let step_started = trace_steps.then(Instant::now);
                let evaluation = match step::evaluate(&ir, s, &ctx.draft, trace_steps) {
                    Ok(evaluation) => evaluation,
                    Err(err) => {
                        stop = Some(Stop::Failed(s, err));
                        break 'pass;
                    }
                };
                if let Some(reads) = &evaluation.reads {
                    self.check_deps(&ir, s, reads, diagnostics);
                }

                if let Some(change) = evaluation.change {
                    let desc = ir.step(s);
                    let out = registry.path(desc.out);
                    let written = state::write_field(&mut ctx.draft, out, change.next.clone());
                    if written.materialized {
                        trace!(field = %desc.label, "materialized missing structure");
                    }
                    ctx.record(Patch {
                        path: desc.label.clone(),
                        reason: match desc.kind {
                            StepKind::Computed => PatchReason::TraitComputed,
                            StepKind::Link => PatchReason::TraitLink,
                        },
                        prev: change.prev,
                        next: Some(change.next),
                        step: Some(s),
                    });
                    exec.mark_dirty(&mut self.scratch, desc.out);
                    changed.push(desc.out);
                    summary.changed_steps += 1;
                    if exec.affects_earlier(scope, desc.out, s) {
                        next_roots.push(desc.out);
                    }
                }
                if let Some(t) = step_started {
                    timings.push((s, t.elapsed()));
                }
            }

            if next_roots.is_empty() {
                break;
            }
            summary.rounds += 1;
            exec.reset_dirty(&mut self.scratch);
            for &id in &next_roots {
                exec.mark_dirty(&mut self.scratch, id);
            }
            exec.compute_plan(&mut self.scratch, scope, &next_roots, &[], None);
            round = self.scratch.plan().to_vec();
            unconditional = false;
        }
        summary.executed_steps = executed;

        let mut carry = None;
        match stop {
            None => {}
            Some(Stop::Cap(reason, at)) => {
                let forced_outs = round[at..]
                    .iter()
                    .filter(|s| unconditional || exec.should_run(&self.scratch, **s))
                    .map(|s| registry.path(exec.out(*s)).clone())
                    .collect();
                let dirty_roots = next_roots
                    .iter()
                    .map(|id| registry.path(*id).clone())
                    .collect();
                let work = CarriedWork {
                    dirty_roots,
                    forced_outs,
                };
                warn!(
                    ?reason,
                    executed,
                    cap,
                    carried = work.forced_outs.len() + work.dirty_roots.len(),
                    "convergence stopped before fixpoint"
                );
                summary.stable = false;
                summary.degrade_reason = Some(reason);
                carry = (!work.is_empty()).then_some(work);
            }
            Some(Stop::Failed(s, err)) => {
                let label = &ir.step(s).label;
                warn!(field = %label, error = %err, "derive failed, rolling back convergence writes");
                ctx.draft = snapshot;
                ctx.patches.truncate(patch_mark);
                changed.clear();
                summary.changed_steps = 0;
                summary.stable = false;
                summary.degrade_reason = Some(DegradeReason::RuntimeError);
                summary.error = Some(format!("{label}: {err}"));
            }
        }

        if trace_steps {
            timings.sort_by(|a, b| b.1.cmp(&a.1));
            summary.top_steps = timings
                .iter()
                .take(diagnostics.config().top_k)
                .map(|(s, d)| StepTiming {
                    label: ir.step(*s).label.clone(),
                    duration_us: d.as_secs_f64() * 1e6,
                })
                .collect();
        }

        let changed = changed.iter().map(|id| registry.path(*id).clone()).collect();
        self.finish(summary, changed, carry, started, detail, diagnostics)
    }

    /// Choose between a full and a planned pass.
    fn decide(
        &mut self,
        txn_seq: u64,
        scope: Scope,
        config: &ConvergeConfig,
        resolved: &ResolvedDirty,
        forced: &[StepId],
        summary: &mut DecisionSummary,
    ) -> (ExecutedMode, Vec<StepId>) {
        let scope_len = self.exec.scope_len(scope);

        let deadline = match config.mode {
            ConvergeMode::Full => {
                summary.reasons.push(DecisionReason::ModuleOverride);
                return (ExecutedMode::Full, self.full_order(scope));
            }
            ConvergeMode::Dirty => {
                summary.reasons.push(DecisionReason::ModuleOverride);
                if resolved.dirty_all.is_some() {
                    summary.reasons.push(DecisionReason::DirtyAll);
                    return (ExecutedMode::Full, self.full_order(scope));
                }
                None
            }
            ConvergeMode::Auto => {
                if txn_seq <= 1 {
                    summary.reasons.push(DecisionReason::ColdStart);
                    return (ExecutedMode::Full, self.full_order(scope));
                }
                if resolved.dirty_all.is_some() {
                    summary.reasons.push(DecisionReason::DirtyAll);
                    return (ExecutedMode::Full, self.full_order(scope));
                }
                let paths = self.ir.registry().len().max(1);
                let ratio = resolved.ids.len() as f64 / paths as f64;
                if ratio >= near_full_threshold(scope_len) {
                    summary.reasons.push(DecisionReason::NearFull);
                    return (ExecutedMode::Full, self.full_order(scope));
                }
                let budget = config.decision_budget();
                (!budget.is_zero()).then(|| Instant::now() + budget)
            }
        };

        let Some(plan) = self.plan(scope, resolved, forced, deadline, summary) else {
            summary.reasons.push(DecisionReason::PlanCutoff);
            return (ExecutedMode::Full, self.full_order(scope));
        };
        if config.mode == ConvergeMode::Auto
            && plan.len() as f64 >= scope_len as f64 * PLAN_NEAR_FULL_RATIO
        {
            summary.reasons.push(DecisionReason::PlanNearFull);
            return (ExecutedMode::Full, self.full_order(scope));
        }
        (ExecutedMode::Dirty, plan)
    }

    fn full_order(&self, scope: Scope) -> Vec<StepId> {
        self.exec.topo(scope).collect()
    }

    /// Plan from the cache or by closure; `None` on a decision cutoff.
    fn plan(
        &mut self,
        scope: Scope,
        resolved: &ResolvedDirty,
        forced: &[StepId],
        deadline: Option<Instant>,
        summary: &mut DecisionSummary,
    ) -> Option<Vec<StepId>> {
        let cacheable = forced.is_empty();
        if cacheable {
            if let Some(hit) = self.plan_cache.get(scope, resolved) {
                summary.reasons.push(DecisionReason::CacheHit);
                summary.cache = Some(self.plan_cache.stats());
                return Some(hit.to_vec());
            }
            summary.reasons.push(DecisionReason::CacheMiss);
        }

        let outcome =
            self.exec
                .compute_plan(&mut self.scratch, scope, &resolved.ids, forced, deadline);
        if outcome == PlanOutcome::Cutoff {
            return None;
        }
        let plan = self.scratch.plan().to_vec();
        if cacheable {
            self.plan_cache.insert(scope, resolved, &plan);
            summary.cache = Some(self.plan_cache.stats());
        }
        Some(plan)
    }

    fn check_deps(&self, ir: &StaticIr, s: StepId, reads: &[FieldPath], diagnostics: &Diagnostics) {
        let desc = ir.step(s);
        if desc.kind != StepKind::Computed {
            return;
        }
        let declared: Vec<FieldPath> = desc
            .deps
            .iter()
            .map(|id| ir.registry().path(*id).clone())
            .collect();
        let Some(diff) = DepsDiff::between(&declared, reads) else {
            return;
        };
        let key = format!("deps:{}:{}", self.key, desc.label);
        diagnostics.warn_once(&key, || {
            DiagnosticEvent::DepsMismatch(DepsMismatchEvent {
                module: self.key.to_string(),
                field: desc.label.clone(),
                missing: diff.missing,
                unused: diff.unused,
            })
        });
    }

    fn finish(
        &self,
        mut summary: DecisionSummary,
        changed: Vec<FieldPath>,
        carried: Option<CarriedWork>,
        started: Instant,
        detail: Detail,
        diagnostics: &Diagnostics,
    ) -> ConvergeOutcome {
        let elapsed = started.elapsed();
        summary.duration_ms = ms(elapsed);
        debug!(
            mode = ?summary.executed_mode,
            executed = summary.executed_steps,
            changed = summary.changed_steps,
            rounds = summary.rounds,
            stable = summary.stable,
            "converge pass"
        );
        if detail != Detail::None {
            diagnostics.emit(DiagnosticEvent::Converge(summary.clone()));
        }
        ConvergeOutcome {
            stable: summary.stable,
            degrade: summary.degrade_reason,
            executed_steps: summary.executed_steps,
            changed,
            carried,
            summary,
            elapsed,
        }
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
