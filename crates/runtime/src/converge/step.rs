//! Evaluation of a single compiled step against a draft.

use std::panic::{AssertUnwindSafe, catch_unwind};

use converge_foundation::{FieldPath, StepId};
use serde_json::Value;

use crate::declaration::StateView;
use crate::error::{DeriveError, panic_message};
use crate::ir::{StaticIr, StepBody};
use crate::state;

/// Result of evaluating a step.
#[derive(Debug)]
pub(crate) struct Evaluation {
    /// New value when it differs from the current one.
    pub change: Option<Change>,
    /// Paths read by the derive function, when traced.
    pub reads: Option<Vec<FieldPath>>,
}

#[derive(Debug)]
pub(crate) struct Change {
    pub prev: Option<Value>,
    pub next: Value,
}

/// Recompute `step` over `draft` and compare with its current output.
///
/// A link whose source is absent leaves its output untouched. Panics inside
/// derive functions are reported as [`DeriveError`]s.
pub(crate) fn evaluate(
    ir: &StaticIr,
    step: StepId,
    draft: &Value,
    trace_reads: bool,
) -> Result<Evaluation, DeriveError> {
    let desc = ir.step(step);
    let out = ir.registry().path(desc.out);
    let prev = state::lookup(draft, out);

    let (next, equals, reads) = match ir.body(step) {
        StepBody::Computed { derive, equals } => {
            let view = if trace_reads {
                StateView::traced(draft)
            } else {
                StateView::new(draft)
            };
            let value = catch_unwind(AssertUnwindSafe(|| derive(&view))).unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref())
                    .unwrap_or_else(|| "derive panicked with a non-string payload".to_string());
                Err(DeriveError::new(message))
            })?;
            let reads = trace_reads.then(|| view.into_reads());
            (Some(value), equals.as_ref(), reads)
        }
        StepBody::Link => {
            let from = desc
                .from
                .map(|id| ir.registry().path(id))
                .and_then(|path| state::read_value(draft, path));
            (from, None, None)
        }
    };

    let Some(next) = next else {
        return Ok(Evaluation {
            change: None,
            reads,
        });
    };

    let same = match (prev, equals) {
        (Some(prev), Some(equals)) => equals(prev, &next),
        (Some(prev), None) => *prev == next,
        (None, _) => false,
    };

    Ok(Evaluation {
        change: (!same).then(|| Change {
            prev: prev.cloned(),
            next,
        }),
        reads,
    })
}
