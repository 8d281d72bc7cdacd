//! Static IR compilation and its execution projection.
//!
//! # Structure
//!
//! - [`FieldPathRegistry`] - Dense ids for field paths via a prefix trie
//! - [`Step`] - One compiled computed or link derivation
//! - [`StaticIr`] - Registry, steps, per-scope topological orders and the
//!   trigger index of one module
//! - [`ExecIr`] - CSR tables and bitsets for repeated plan computation
//! - [`IrCache`] - Digest-keyed cache with per-module generations
//!
//! # Compilation
//!
//! [`compile`] validates the declaration (path collisions across groups,
//! explicit deps, wildcard outputs, link sources), assigns ids, and sorts the
//! steps with Kahn's algorithm once per scope. A residual cycle among
//! immediate steps is a [`crate::Error::ImmediateCycle`]; cycles through
//! deferred steps are kept and left to the runtime caps.
//!
//! # Trigger Index
//!
//! For a changed path `p` the affected steps are those with a dependency or
//! output that overlaps `p`: equal to one of `p`'s ancestors (looked up in
//! `exact` along the prefix chain) or lying at or under `p` (`under[p]`).

mod builder;
mod cache;
mod exec;
mod registry;
mod topology;
mod types;


pub use builder::{IrBuilder, compile};
pub use cache::{CompiledModule, IrCache};
pub use exec::{BitSet, Csr, ExecIr, ExecScratch, PlanOutcome, SMALL_GRAPH_STEPS};
pub use registry::FieldPathRegistry;
pub use topology::CycleError;
pub use types::{
    Scope, ScopeOrder, SharedIr, StaticIr, StaticIrExport, Step, StepKind, TriggerIndex,
};
pub(crate) use types::StepBody;
