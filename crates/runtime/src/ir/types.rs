//! Core static IR types.

use std::fmt;
use std::sync::Arc;

use converge_foundation::{FieldPath, FieldPathId, ModuleId, StepId};
use serde::Serialize;

use crate::declaration::{DeriveFn, EqualsFn, Scheduling};

use super::registry::FieldPathRegistry;

/// Kind of a compiled step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Runs a derive function.
    Computed,
    /// Copies a value from another path.
    Link,
}

/// A compiled derivation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    /// Dense index, in output path order.
    pub id: StepId,
    /// Whether the step derives or copies.
    pub kind: StepKind,
    /// Field the step writes.
    pub out: FieldPathId,
    /// Declared dependencies (the link source for links).
    pub deps: Vec<FieldPathId>,
    /// Link source.
    pub from: Option<FieldPathId>,
    /// Immediate steps run in the commit pass; deferred steps wait for the lane
    /// unless the store runs them inline.
    pub scheduling: Scheduling,
    /// Output path as declared, for logs.
    pub label: String,
    /// Declaration group that owns the field.
    pub group: String,
}

/// Executable part of a step, kept out of [`Step`] so the descriptor stays
/// plain data.
#[derive(Clone)]
pub(crate) enum StepBody {
    Computed {
        derive: DeriveFn,
        equals: Option<EqualsFn>,
    },
    Link,
}

impl fmt::Debug for StepBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Computed { equals, .. } => f
                .debug_struct("Computed")
                .field("custom_equals", &equals.is_some())
                .finish_non_exhaustive(),
            Self::Link => f.write_str("Link"),
        }
    }
}

/// Which steps a convergence pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every step; used when deferred steps run inline.
    All,
    /// Immediate steps only.
    Immediate,
    /// Deferred steps only.
    Deferred,
}

impl Scope {
    pub(crate) const ALL: [Scope; 3] = [Scope::All, Scope::Immediate, Scope::Deferred];

    pub(crate) const fn index(self) -> usize {
        match self {
            Scope::All => 0,
            Scope::Immediate => 1,
            Scope::Deferred => 2,
        }
    }

    pub(crate) fn includes(self, scheduling: Scheduling) -> bool {
        match self {
            Scope::All => true,
            Scope::Immediate => scheduling == Scheduling::Immediate,
            Scope::Deferred => scheduling == Scheduling::Deferred,
        }
    }
}

/// Topological order of one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeOrder {
    /// Steps, dependencies before dependents. Steps left over by a tolerated
    /// cycle come last, in id order.
    pub order: Vec<StepId>,
    /// The steps left over by a tolerated cycle.
    pub cyclic: Vec<StepId>,
}

impl ScopeOrder {
    pub fn has_back_edges(&self) -> bool {
        !self.cyclic.is_empty()
    }
}

/// For each field path, the steps to reconsider when it changes.
#[derive(Debug, Clone, Default)]
pub struct TriggerIndex {
    /// Steps whose dependency or output is exactly this path.
    pub exact: Vec<Vec<StepId>>,
    /// Steps whose dependency or output lies at or under this path.
    pub under: Vec<Vec<StepId>>,
}

/// Compiled dependency graph of one module.
///
/// Immutable once built; shared between instances through `Arc`.
#[derive(Debug)]
pub struct StaticIr {
    pub(crate) module_id: ModuleId,
    pub(crate) registry: FieldPathRegistry,
    pub(crate) steps: Vec<Step>,
    pub(crate) bodies: Vec<StepBody>,
    pub(crate) orders: [ScopeOrder; 3],
    pub(crate) levels: Vec<Vec<StepId>>,
    pub(crate) triggers: TriggerIndex,
    pub(crate) reserved: Vec<FieldPath>,
    pub(crate) shape_warnings: Vec<FieldPath>,
    pub(crate) digest: u64,
    pub(crate) generation: u64,
}

impl StaticIr {
    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    pub fn registry(&self) -> &FieldPathRegistry {
        &self.registry
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.index()]
    }

    /// The step writing `out`, if any.
    pub fn step_for_out(&self, out: FieldPathId) -> Option<StepId> {
        // Steps are sorted by output, and ids follow path order.
        self.steps
            .binary_search_by_key(&out, |s| s.out)
            .ok()
            .map(StepId::from_index)
    }

    pub(crate) fn body(&self, id: StepId) -> &StepBody {
        &self.bodies[id.index()]
    }

    /// Topological order of a scope.
    pub fn order(&self, scope: Scope) -> &ScopeOrder {
        &self.orders[scope.index()]
    }

    /// Topological levels over all steps; steps within a level are independent.
    pub fn levels(&self) -> &[Vec<StepId>] {
        &self.levels
    }

    pub fn triggers(&self) -> &TriggerIndex {
        &self.triggers
    }

    /// Paths reserved by non-derivation entries.
    pub fn reserved_paths(&self) -> &[FieldPath] {
        &self.reserved
    }

    /// Derived outputs absent from the declared state shape.
    pub fn shape_warnings(&self) -> &[FieldPath] {
        &self.shape_warnings
    }

    /// Content digest of the compiled graph.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of deferred steps.
    pub fn deferred_count(&self) -> usize {
        self.order(Scope::Deferred).order.len()
    }

    /// Serializable description for tooling.
    pub fn export(&self) -> StaticIrExport {
        StaticIrExport {
            module_id: self.module_id.clone(),
            digest: format!("{:016x}", self.digest),
            generation: self.generation,
            field_paths: self.registry.iter().map(|(_, p)| p.clone()).collect(),
            steps: self.steps.clone(),
            topo_order: self.order(Scope::All).order.clone(),
            levels: self.levels.clone(),
            reserved: self.reserved.clone(),
        }
    }
}

/// Exported form of a [`StaticIr`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticIrExport {
    pub module_id: ModuleId,
    pub digest: String,
    pub generation: u64,
    /// Registered paths in id order.
    pub field_paths: Vec<FieldPath>,
    pub steps: Vec<Step>,
    pub topo_order: Vec<StepId>,
    pub levels: Vec<Vec<StepId>>,
    pub reserved: Vec<FieldPath>,
}

/// Shared handle to a compiled IR.
pub type SharedIr = Arc<StaticIr>;
