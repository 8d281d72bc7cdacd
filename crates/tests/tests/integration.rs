//! End-to-end scenarios for the converge runtime.
//!
//! These tests drive whole runtimes: declare → register → transact →
//! flush → verify state, patch logs and diagnostics events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use converge_runtime::converge::deferred::LaneReason;
use converge_runtime::diagnostics::TickPhase;
use converge_runtime::policy::lane::{LaneOverrideMode, LanePolicyPatch};
use converge_runtime::{
    DegradeReason, DiagnosticEvent, OverrideSet, PatchReason, Priority, RuntimeConfig, TickConfig,
    TxnMeta,
};
use converge_tests::{ScenarioHarness, derived_paths, patches_of, scenarios};
use serde_json::json;
use tokio::time::{Instant, sleep};

/// Scenario A: one mutation produces exactly one derived patch, in one pass.
#[test]
fn test_scenario_a_single_pass_patch() {
    let mut h = ScenarioHarness::new();
    let key = h.register(&scenarios::scenario_a(), "a", scenarios::scenario_a_initial());

    h.set(&key, "a", json!(5));
    let report = h.flush();

    assert!(report.stable);
    let unit = report.unit(&key).expect("instance accepted");
    assert_eq!(unit.passes, 1);
    let derived = patches_of(&report, &key, Some(PatchReason::TraitComputed));
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].path, "derivedA");
    assert_eq!(derived[0].prev, Some(json!(1)));
    assert_eq!(derived[0].next, Some(json!(6)));
    assert_eq!(h.state(&key), json!({"a": 5, "derivedA": 6}));
}

/// Fixpoint idempotence: nothing queued means no work and no tick.
#[test]
fn test_follow_up_flush_is_idle() {
    let mut h = ScenarioHarness::new();
    let key = h.register(&scenarios::scenario_a(), "a", scenarios::scenario_a_initial());
    h.set(&key, "a", json!(5));
    h.flush();

    let report = h.flush();
    assert!(report.idle);
    assert!(report.units.is_empty());
    assert_eq!(h.runtime().tick_seq(), 1);

    // Writing the value already there commits nothing either.
    h.set(&key, "a", json!(5));
    assert!(h.flush().idle);
    assert_eq!(h.runtime().txn_seq(&key).unwrap(), 1);
}

/// Scenario B: a link runs after the computed field it copies.
#[test]
fn test_scenario_b_link_follows_computed_source() {
    let mut h = ScenarioHarness::new();
    let key = h.register(&scenarios::checkout(), "cart", scenarios::checkout_initial());

    h.set(&key, "profile.firstName", json!("Grace"));
    let report = h.flush();

    assert_eq!(
        derived_paths(&report, &key),
        ["profile.fullName", "shipping.recipientName"]
    );
    let link = patches_of(&report, &key, Some(PatchReason::TraitLink));
    assert_eq!(link[0].next, Some(json!("Grace Lovelace")));
    assert_eq!(
        h.get(&key, "shipping.recipientName"),
        Some(json!("Grace Lovelace"))
    );
}

/// Every step settles after the steps it depends on.
#[test]
fn test_topological_order_in_diamond() {
    let mut h = ScenarioHarness::new();
    let key = h.register(&scenarios::diamond(), "d", scenarios::diamond_initial());

    h.set(&key, "base", json!(2));
    let report = h.flush();
    let order = derived_paths(&report, &key);
    let at = |p: &str| order.iter().position(|o| o == p).expect("step ran");

    assert!(at("left") < at("sum"));
    assert!(at("right") < at("sum"));
    assert!(at("sum") < at("label"));
    assert_eq!(h.get(&key, "label"), Some(json!("sum=23")));
}

/// Same IR and mutations give the same patch sequence.
#[test]
fn test_patch_sequence_is_deterministic() {
    let run = || {
        let mut h = ScenarioHarness::new();
        let key = h.register(&scenarios::diamond(), "d", scenarios::diamond_initial());
        let mut log = Vec::new();
        for base in [3, 1, 4, 1, 5] {
            h.set(&key, "base", json!(base));
            let report = h.flush();
            log.push(serde_json::to_value(&report.unit(&key).unwrap().patches).unwrap());
        }
        log
    };
    assert_eq!(run(), run());
}

/// With `urgent_step_cap = N`, a cycle never runs more than N steps per
/// tick, reports `cycle_detected` until it settles, and loses no work.
#[test]
fn test_budget_safety_with_cyclic_chain() {
    const CAP: usize = 5;
    let mut h = ScenarioHarness::with_config(RuntimeConfig {
        tick: TickConfig {
            urgent_step_cap: CAP,
            ..TickConfig::default()
        },
        ..RuntimeConfig::default()
    });
    let key = h.register(&scenarios::clamp_cycle(20), "c", scenarios::clamp_initial());

    h.set(&key, "y", json!(1));
    let reports = h.flush_until_idle(100);
    let (last, unstable) = reports.split_last().expect("at least one tick");

    assert!(!unstable.is_empty());
    for report in unstable {
        assert!(report.steps <= CAP, "tick {} ran {} steps", report.tick_seq, report.steps);
        assert!(!report.stable);
        assert_eq!(report.degrade_reason, Some(DegradeReason::CycleDetected));
        assert_eq!(report.backlog, (1, 0));
    }
    assert!(last.stable);
    assert!(last.steps <= CAP);
    assert_eq!(h.state(&key), json!({"x": 20, "y": 20}));

    let exceeded = h
        .events("trace:tick")
        .into_iter()
        .filter(|e| matches!(e, DiagnosticEvent::Tick(t) if t.phase == TickPhase::BudgetExceeded))
        .count();
    assert_eq!(exceeded, 0, "one unit per tick never hits the cap between units");
}

/// A link cycle across instances settles one hop per tick.
#[test]
fn test_cross_instance_cycle_waits_for_next_tick() {
    let mut h = ScenarioHarness::new();
    let a = h.register(&scenarios::counter(), "a", scenarios::counter_initial());
    let b = h.register(&scenarios::counter(), "b", scenarios::counter_initial());
    h.runtime().link_instances(&a, "double", &b, "n").unwrap();
    h.runtime().link_instances(&b, "n", &a, "mirror").unwrap();

    h.set(&a, "n", json!(3));
    let first = h.flush();
    assert_eq!(first.rounds, 2);
    assert_eq!(h.get(&b, "double"), Some(json!(12)));
    assert!(!first.stable);
    assert_eq!(first.degrade_reason, Some(DegradeReason::CycleDetected));

    let second = h.flush();
    assert!(second.stable);
    assert_eq!(h.get(&a, "mirror"), Some(json!(6)));
    assert!(h.flush().idle);
}

/// Normal priority wins a tick too small for both units.
#[test]
fn test_priority_ordering() {
    let mut h = ScenarioHarness::with_config(RuntimeConfig {
        tick: TickConfig {
            max_steps: 1,
            ..TickConfig::default()
        },
        ..RuntimeConfig::default()
    });
    let urgent = h.register(&scenarios::counter(), "urgent", scenarios::counter_initial());
    let background = h.register(&scenarios::counter(), "background", scenarios::counter_initial());

    h.transact(
        &background,
        TxnMeta::action("prefetch").with_priority(Priority::Low),
        |txn| txn.set("n", json!(7)),
    );
    h.transact(&urgent, TxnMeta::action("type"), |txn| txn.set("n", json!(3)));

    let report = h.flush();
    assert_eq!(h.get(&urgent, "double"), Some(json!(6)));
    assert_eq!(h.state(&background), scenarios::counter_initial());
    assert_eq!(report.deferred, vec![background.clone()]);
    assert!(!report.stable);
    assert_eq!(report.degrade_reason, Some(DegradeReason::BudgetSteps));
    assert_eq!(report.backlog, (0, 1));
    assert_eq!(h.events("warn:priority-inversion").len(), 1);

    let next = h.flush();
    assert!(next.stable);
    assert_eq!(h.get(&background, "double"), Some(json!(14)));
}

/// Scenario C: two signals 10ms apart run the deferred step once, 50ms
/// after the second.
#[tokio::test(start_paused = true)]
async fn test_scenario_c_debounced_deferred_step() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut h = ScenarioHarness::new();
    let key = h.register(
        &scenarios::search(50, runs.clone(), None),
        "box",
        scenarios::search_initial(),
    );
    let settled_at = Arc::new(Mutex::new(None));
    let at = settled_at.clone();
    h.runtime()
        .subscribe(&key, move |_, state| {
            if state["results"]["count"] == json!(2) {
                *at.lock().unwrap() = Some(Instant::now());
            }
        })
        .unwrap();

    h.set(&key, "query", json!("a"));
    h.flush();
    assert_eq!(h.get(&key, "echo"), Some(json!("a")));
    sleep(Duration::from_millis(10)).await;

    h.set(&key, "query", json!("ab"));
    h.flush();
    let second = Instant::now();
    assert!(h.runtime().lane_pending(&key).unwrap());

    sleep(Duration::from_millis(49)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.get(&key, "results.count"), Some(json!(0)));

    sleep(Duration::from_millis(2)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.get(&key, "results.count"), Some(json!(2)));
    let at = (*settled_at.lock().unwrap()).expect("lane flush notified listeners");
    assert_eq!(at - second, Duration::from_millis(50));

    let lanes = h.events("trace:txn-lane");
    assert_eq!(lanes.len(), 1);
    let DiagnosticEvent::TxnLane(event) = &lanes[0] else {
        unreachable!()
    };
    assert_eq!(event.evidence.signals, 2);
    assert_eq!(event.evidence.coalesced, 1);
}

/// `forced_sync` runs deferred steps in the same unit and still records
/// lane evidence.
#[test]
fn test_forced_sync_lane_runs_deferred_in_unit() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut h = ScenarioHarness::new();
    let key = h.register(
        &scenarios::search(50, runs.clone(), Some(LaneOverrideMode::ForcedSync)),
        "box",
        scenarios::search_initial(),
    );

    h.set(&key, "query", json!("abc"));
    let report = h.flush();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.get(&key, "results.count"), Some(json!(3)));
    let unit = report.unit(&key).unwrap();
    assert_eq!(unit.passes, 2);
    let evidence = unit.lane.as_ref().expect("lane evidence recorded");
    assert!(evidence.reasons.contains(&LaneReason::ForcedSync));
    assert_eq!(h.events("trace:txn-lane").len(), 1);
}

/// Switching a lane off replays its pending work instead of dropping it.
#[tokio::test(start_paused = true)]
async fn test_lane_mode_switch_replays_backlog() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut h = ScenarioHarness::new();
    let key = h.register(
        &scenarios::search(50, runs.clone(), None),
        "box",
        scenarios::search_initial(),
    );

    h.set(&key, "query", json!("abcd"));
    h.flush();
    assert!(h.runtime().lane_pending(&key).unwrap());

    let forced_off = OverrideSet {
        lanes: LanePolicyPatch {
            override_mode: Some(LaneOverrideMode::ForcedOff),
            ..LanePolicyPatch::default()
        },
        ..OverrideSet::default()
    };
    h.runtime()
        .set_provider_overrides(&key, Some(forced_off))
        .unwrap();
    assert!(!h.runtime().lane_pending(&key).unwrap());
    assert_eq!(h.runtime().backlog(), (1, 0));

    let report = h.flush();
    assert!(report.stable);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.get(&key, "results.count"), Some(json!(4)));
    let evidence = report.unit(&key).unwrap().lane.clone().unwrap();
    assert_eq!(evidence.canceled, 1);
    assert!(evidence.reasons.contains(&LaneReason::ForcedOff));

    // Nothing is left for the old lane to flush.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// A failing handler is reported and the watcher keeps serving.
#[tokio::test]
async fn test_handler_failure_is_isolated() {
    let mut h = ScenarioHarness::new();
    let key = h.register(&scenarios::counter(), "c", scenarios::counter_initial());
    let target = key.clone();
    let watcher = h
        .runtime()
        .watch(&key, "set", move |rt, payload| {
            let key = target.clone();
            async move {
                let n = payload.as_i64().ok_or_else(|| format!("not a number: {payload}"))?;
                rt.set(&key, "n", json!(n)).map_err(|e| e.to_string())
            }
        })
        .unwrap();

    watcher.dispatch(json!("seven")).await.unwrap();
    watcher.dispatch(json!(7)).await.unwrap();
    let stats = loop {
        if h.runtime().backlog() == (1, 0) {
            break watcher.shutdown().await;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);

    h.flush();
    assert_eq!(h.get(&key, "double"), Some(json!(14)));
    let failures = h.events("diagnostic:handler-failure");
    assert_eq!(failures.len(), 1);
    let DiagnosticEvent::HandlerFailure(event) = &failures[0] else {
        unreachable!()
    };
    assert_eq!(event.action, "set");
    assert!(event.message.contains("not a number"));
}

/// Declared paths missing from the state shape warn once per path.
#[test]
fn test_schema_mismatch_warned_once() {
    use converge_runtime::StateShape;

    let h = ScenarioHarness::new();
    let declaration = scenarios::counter().shape(StateShape::from_paths(["n"]));
    h.register(&declaration, "a", json!({"n": 1}));
    h.register(&declaration, "b", json!({"n": 2}));

    let warnings = h.events("warn:schema-mismatch");
    assert_eq!(warnings.len(), 1);
    let DiagnosticEvent::SchemaMismatch(event) = &warnings[0] else {
        unreachable!()
    };
    assert_eq!(event.path, "double");
    assert_eq!(h.runtime().ir_cache_stats(), (1, 1));
}
