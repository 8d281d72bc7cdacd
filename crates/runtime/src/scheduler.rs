//! Tick scheduler.
//!
//! A tick drains the queued commits of every instance in one globally
//! ordered pass:
//!
//! 1. Instances whose merged commits are urgent (normal priority) go first,
//!    in enqueue order. Together they may run at most `urgent_step_cap`
//!    convergence steps; once spent, the remaining urgent instances wait
//!    and the tick degrades with `cycle_detected`.
//! 2. Non-urgent instances follow while fewer than `max_steps` units have
//!    been accepted; the rest wait for a later tick and a
//!    `warn:priority-inversion` is emitted. A tick without any accepted
//!    unit always takes one non-urgent unit.
//! 3. Link writes produced by settled instances queue commits on their
//!    targets; up to `max_drain_rounds` rounds absorb the cascade.
//!
//! An instance is accepted at most once per tick. Work that lands on an
//! already accepted instance waits for the next tick and marks the tick
//! unstable with `cycle_detected`.

use std::collections::HashSet;

use converge_foundation::ModuleKey;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use crate::config::TickConfig;
use crate::converge::{DegradeReason, Patch};
use crate::converge::deferred::LaneEvidence;
use crate::diagnostics::{
    DiagnosticEvent, Diagnostics, PriorityInversionEvent, TickEvent, TickPhase,
};
use crate::links::LinkTable;
use crate::state;
use crate::store::{CommitKind, Priority, Store};

/// Outcome of one accepted instance unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub module: ModuleKey,
    pub priority: Priority,
    /// Kinds of the commits merged into the unit.
    pub kinds: Vec<CommitKind>,
    pub txn_seq: u64,
    /// Convergence passes run.
    pub passes: usize,
    pub steps: usize,
    /// Patch log of the unit, user writes first, then derived writes in
    /// step order.
    pub patches: Vec<Patch>,
    pub stable: bool,
    pub degrade_reason: Option<DegradeReason>,
    /// Whether the committed state changed.
    pub changed: bool,
    /// Evidence of deferred work run in this unit.
    pub lane: Option<LaneEvidence>,
}

impl UnitReport {
    pub(crate) fn new(
        module: ModuleKey,
        priority: Priority,
        kinds: Vec<CommitKind>,
        txn_seq: u64,
    ) -> Self {
        Self {
            module,
            priority,
            kinds,
            txn_seq,
            passes: 0,
            steps: 0,
            patches: Vec::new(),
            stable: true,
            degrade_reason: None,
            changed: false,
            lane: None,
        }
    }

    pub(crate) fn degrade(&mut self, reason: DegradeReason) {
        self.stable = false;
        self.degrade_reason.get_or_insert(reason);
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub tick_seq: u64,
    /// Nothing was queued; the tick sequence did not advance.
    pub idle: bool,
    pub stable: bool,
    pub degrade_reason: Option<DegradeReason>,
    /// Convergence steps run by every unit.
    pub steps: usize,
    /// Convergence steps run by urgent units.
    pub urgent_steps: usize,
    pub rounds: usize,
    pub units: Vec<UnitReport>,
    /// Non-urgent instances pushed to a later tick.
    pub deferred: Vec<ModuleKey>,
    /// Instances still queued after the tick, (urgent, non-urgent).
    pub backlog: (usize, usize),
}

impl TickReport {
    fn new(tick_seq: u64) -> Self {
        Self {
            tick_seq,
            idle: false,
            stable: true,
            degrade_reason: None,
            steps: 0,
            urgent_steps: 0,
            rounds: 0,
            units: Vec::new(),
            deferred: Vec::new(),
            backlog: (0, 0),
        }
    }

    fn idle(tick_seq: u64) -> Self {
        Self {
            idle: true,
            ..Self::new(tick_seq)
        }
    }

    fn degrade(&mut self, reason: DegradeReason) {
        self.stable = false;
        self.degrade_reason.get_or_insert(reason);
    }

    /// Report of the unit accepted for `key`, if any.
    pub fn unit(&self, key: &ModuleKey) -> Option<&UnitReport> {
        self.units.iter().find(|u| &u.module == key)
    }
}

/// Result of a tick plus the work the caller finishes outside the lock.
#[derive(Debug)]
pub(crate) struct TickOutput {
    pub report: TickReport,
    /// Latest committed state of every instance that changed.
    pub changed: IndexMap<ModuleKey, Value>,
}

/// Drains queued commits tick by tick.
#[derive(Debug)]
pub(crate) struct Scheduler {
    config: TickConfig,
    tick_seq: u64,
}

impl Scheduler {
    pub fn new(config: TickConfig) -> Self {
        Self {
            config,
            tick_seq: 0,
        }
    }

    pub fn tick_seq(&self) -> u64 {
        self.tick_seq
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    /// Run one tick over every queued instance.
    #[instrument(skip_all, name = "flush", fields(tick_seq = self.tick_seq + 1))]
    pub fn tick(
        &mut self,
        store: &mut Store,
        links: &LinkTable,
        diagnostics: &Diagnostics,
    ) -> TickOutput {
        let backlog = store.backlog();
        if backlog == (0, 0) {
            trace!("idle tick");
            return TickOutput {
                report: TickReport::idle(self.tick_seq),
                changed: IndexMap::new(),
            };
        }

        self.tick_seq += 1;
        let tick_seq = self.tick_seq;
        let config = self.config.clone();
        diagnostics.emit(DiagnosticEvent::Tick(TickEvent {
            tick_seq,
            phase: TickPhase::Start,
            max_steps: config.max_steps,
            urgent_step_cap: config.urgent_step_cap,
            backlog,
            steps: 0,
            stable: None,
            degrade_reason: None,
        }));

        let mut report = TickReport::new(tick_seq);
        let mut changed = IndexMap::new();
        let mut skip: HashSet<ModuleKey> = HashSet::new();
        let mut accepted: Vec<ModuleKey> = Vec::new();
        let mut budget_exceeded = false;

        for _ in 0..config.max_drain_rounds.max(1) {
            let ready = store.ready(&skip);
            if ready.is_empty() {
                break;
            }
            report.rounds += 1;

            for (key, priority) in ready {
                let budget = match priority {
                    Priority::Normal => {
                        let remaining = config.urgent_step_cap.saturating_sub(report.urgent_steps);
                        if remaining == 0 {
                            report.degrade(DegradeReason::CycleDetected);
                            if !budget_exceeded {
                                budget_exceeded = true;
                                warn!(
                                    tick_seq,
                                    urgent_steps = report.urgent_steps,
                                    cap = config.urgent_step_cap,
                                    "urgent step cap reached"
                                );
                                diagnostics.emit(DiagnosticEvent::Tick(TickEvent {
                                    tick_seq,
                                    phase: TickPhase::BudgetExceeded,
                                    max_steps: config.max_steps,
                                    urgent_step_cap: config.urgent_step_cap,
                                    backlog: store.backlog(),
                                    steps: report.steps,
                                    stable: Some(false),
                                    degrade_reason: Some(DegradeReason::CycleDetected),
                                }));
                            }
                            skip.insert(key);
                            continue;
                        }
                        Some(remaining)
                    }
                    Priority::Low => {
                        let starving = report.units.is_empty();
                        if report.units.len() >= config.max_steps && !starving {
                            trace!(module = %key, "non-urgent unit deferred");
                            report.deferred.push(key.clone());
                            skip.insert(key);
                            continue;
                        }
                        None
                    }
                };

                let Ok(instance) = store.get_mut(&key) else {
                    continue;
                };
                let Some(unit) = instance.take_unit() else {
                    continue;
                };
                let (unit_report, previous) = instance.apply(unit, diagnostics, budget);
                let current = unit_report.changed.then(|| instance.state().clone());

                if priority == Priority::Normal {
                    report.urgent_steps += unit_report.steps;
                }
                report.steps += unit_report.steps;
                if let Some(reason) = unit_report.degrade_reason {
                    report.degrade(reason);
                }

                if let Some(current) = current {
                    for write in links.propagate(&key, &previous, &current) {
                        let link = write.link;
                        let prev = store
                            .get(&link.dst)
                            .ok()
                            .and_then(|dst| state::read_value(dst.pending(), &link.dst_path));
                        if prev.as_ref() == Some(&write.value) {
                            continue;
                        }
                        let commit = link.commit(write.value, prev, priority);
                        if let Err(err) = store.enqueue(&link.dst, commit) {
                            warn!(error = %err, "dropping link write");
                        }
                    }
                    changed.insert(key.clone(), current);
                }

                skip.insert(key.clone());
                accepted.push(key);
                report.units.push(unit_report);
            }
        }

        let requeued = store.requeued(&accepted);
        if !requeued.is_empty() {
            debug!(tick_seq, instances = requeued.len(), "instances dirtied again, deferred to next tick");
            report.degrade(DegradeReason::CycleDetected);
        }

        if !report.deferred.is_empty() {
            report.degrade(DegradeReason::BudgetSteps);
            warn!(
                tick_seq,
                deferred = report.deferred.len(),
                "non-urgent work deferred behind urgent work"
            );
            diagnostics.emit(DiagnosticEvent::PriorityInversion(PriorityInversionEvent {
                tick_seq,
                deferred: report.deferred.iter().map(ToString::to_string).collect(),
                urgent_steps: report.urgent_steps,
                max_steps: config.max_steps,
            }));
        }

        report.backlog = store.backlog();
        diagnostics.emit(DiagnosticEvent::Tick(TickEvent {
            tick_seq,
            phase: TickPhase::Settled,
            max_steps: config.max_steps,
            urgent_step_cap: config.urgent_step_cap,
            backlog: report.backlog,
            steps: report.steps,
            stable: Some(report.stable),
            degrade_reason: report.degrade_reason,
        }));
        debug!(
            tick_seq,
            units = report.units.len(),
            steps = report.steps,
            stable = report.stable,
            "tick settled"
        );

        TickOutput { report, changed }
    }
}
