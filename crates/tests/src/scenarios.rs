//! Module declarations for the built-in scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use converge_runtime::policy::lane::{LaneOverrideMode, LanePolicyPatch};
use converge_runtime::{
    ConvergeConfigPatch, DeclarationGroup, FieldEntry, ModuleDeclaration, ModuleOptions,
    TimeSlicingPatch,
};
use serde_json::{Value, json};

/// `derivedA = a + 1`.
pub fn scenario_a() -> ModuleDeclaration {
    ModuleDeclaration::new("scenario-a").group(DeclarationGroup::new("derived").field(
        "derivedA",
        FieldEntry::computed(["a"], |s| Ok(json!(s.get("a").as_i64().unwrap_or(0) + 1))),
    ))
}

pub fn scenario_a_initial() -> Value {
    json!({"a": 0, "derivedA": 1})
}

/// A computed full name copied into the shipping address by a link.
pub fn checkout() -> ModuleDeclaration {
    ModuleDeclaration::new("checkout")
        .group(DeclarationGroup::new("profile").field(
            "profile.fullName",
            FieldEntry::computed(["profile.firstName", "profile.lastName"], |s| {
                Ok(json!(format!(
                    "{} {}",
                    s.string("profile.firstName"),
                    s.string("profile.lastName")
                )))
            }),
        ))
        .group(
            DeclarationGroup::new("shipping")
                .field("shipping.recipientName", FieldEntry::link("profile.fullName")),
        )
}

pub fn checkout_initial() -> Value {
    json!({
        "profile": {"firstName": "Ada", "lastName": "Lovelace", "fullName": "Ada Lovelace"},
        "shipping": {"recipientName": "Ada Lovelace"}
    })
}

/// A search box: `echo` follows the query immediately, `results.count` is
/// an expensive deferred step counted in `runs`.
///
/// Time slicing is on with the given debounce; `lane` optionally forces a
/// lane mode.
pub fn search(
    debounce_ms: u64,
    runs: Arc<AtomicUsize>,
    lane: Option<LaneOverrideMode>,
) -> ModuleDeclaration {
    let options = ModuleOptions {
        converge: ConvergeConfigPatch {
            time_slicing: Some(TimeSlicingPatch {
                enabled: Some(true),
                debounce_ms: Some(debounce_ms),
                max_lag_ms: Some(debounce_ms * 4),
            }),
            ..ConvergeConfigPatch::default()
        },
        lanes: LanePolicyPatch {
            override_mode: lane,
            ..LanePolicyPatch::default()
        },
        ..ModuleOptions::default()
    };
    ModuleDeclaration::new("search")
        .group(
            DeclarationGroup::new("search")
                .field("echo", FieldEntry::link("query"))
                .field(
                    "results.count",
                    FieldEntry::computed(["query"], move |s| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(s.string("query").len()))
                    })
                    .deferred(),
                ),
        )
        .options(options)
}

pub fn search_initial() -> Value {
    json!({"query": "", "echo": "", "results": {"count": 0}})
}

/// `x = min(y + 1, limit)` and a deferred `y = x`: a cycle that climbs one
/// step per round until it reaches `limit`.
pub fn clamp_cycle(limit: i64) -> ModuleDeclaration {
    ModuleDeclaration::new("clamp").group(
        DeclarationGroup::new("cycle")
            .field(
                "x",
                FieldEntry::computed(["y"], move |s| {
                    Ok(json!((s.get("y").as_i64().unwrap_or(0) + 1).min(limit)))
                }),
            )
            .field("y", FieldEntry::link("x").deferred()),
    )
}

pub fn clamp_initial() -> Value {
    json!({"x": 0, "y": 0})
}

/// `double = n * 2`.
pub fn counter() -> ModuleDeclaration {
    ModuleDeclaration::new("counter").group(DeclarationGroup::new("derived").field(
        "double",
        FieldEntry::computed(["n"], |s| Ok(json!(s.get("n").as_i64().unwrap_or(0) * 2))),
    ))
}

pub fn counter_initial() -> Value {
    json!({"n": 0, "double": 0})
}

/// A diamond `base -> left, right -> sum` plus a tail `label` off `sum`.
pub fn diamond() -> ModuleDeclaration {
    ModuleDeclaration::new("diamond").group(
        DeclarationGroup::new("derived")
            .field(
                "label",
                FieldEntry::computed(["sum"], |s| Ok(json!(format!("sum={}", s.get("sum"))))),
            )
            .field(
                "sum",
                FieldEntry::computed(["left", "right"], |s| {
                    Ok(json!(
                        s.get("left").as_i64().unwrap_or(0) + s.get("right").as_i64().unwrap_or(0)
                    ))
                }),
            )
            .field(
                "left",
                FieldEntry::computed(["base"], |s| Ok(json!(s.get("base").as_i64().unwrap_or(0) + 1))),
            )
            .field(
                "right",
                FieldEntry::computed(["base"], |s| Ok(json!(s.get("base").as_i64().unwrap_or(0) * 10))),
            ),
    )
}

pub fn diamond_initial() -> Value {
    json!({"base": 0, "left": 1, "right": 0, "sum": 1, "label": "sum=1"})
}
