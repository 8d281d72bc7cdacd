// Allow unwrap in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Converge Runtime
//!
//! Keeps the derived fields of reactive state containers consistent with
//! their inputs, recomputing only what a change can reach.
//!
//! ## Architecture
//!
//! ```text
//! ModuleDeclaration ──compile──> StaticIr ──project──> ExecIr
//!                                                        │
//! StateTransaction ──commit──> Store ──tick──> Scheduler ─┤
//!        ▲                       ▲                       ▼
//!    watchers               links, lanes        ConvergeExecutor
//! ```
//!
//! - [`declaration`] - Field entries, groups and module declarations
//! - [`ir`] - Static IR compiler, IR cache and the dense execution projection
//! - [`converge`] - Dirty sets, convergence passes and the deferred lane
//! - [`transaction`] - Drafts and commits of user writes
//! - [`scheduler`] - Tick scheduling across instances
//! - [`links`] - Value copies between instances
//! - [`handlers`] - Per-action watcher tasks
//! - [`policy`] / [`config`] - Layered configuration
//! - [`diagnostics`] - Machine-readable events and sinks
//! - [`runtime`] - The [`Runtime`] handle tying it together

pub mod config;
pub mod converge;
pub mod declaration;
pub mod diagnostics;
pub mod error;
pub mod handlers;
pub mod ir;
pub mod links;
pub mod policy;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod transaction;

pub use config::{
    ConvergeConfig, ConvergeConfigPatch, ConvergeMode, OverrideSet, ResolvedPolicies,
    RuntimeConfig, TickConfig, TimeSlicingConfig, TimeSlicingPatch,
};
pub use converge::{DegradeReason, DirtyAllReason, PatchReason};
pub use declaration::{
    DeclarationGroup, FieldEntry, ModuleDeclaration, ModuleOptions, StateShape, StateView,
};
pub use diagnostics::{
    DiagnosticEvent, Diagnostics, DiagnosticsConfig, DiagnosticsLevel, DiagnosticsSink,
    MemorySink, TracingSink,
};
pub use error::{DeriveError, Error, Result};
pub use handlers::{HandlerResult, WatcherHandle, WatcherStats};
pub use ir::{CompiledModule, IrCache, StaticIr, StaticIrExport};
pub use links::InstanceLink;
pub use runtime::{Runtime, SubscriptionId};
pub use scheduler::{TickReport, UnitReport};
pub use store::{CommitKind, Priority};
pub use transaction::{StateTransaction, TxnMeta};
