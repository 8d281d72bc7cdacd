//! Declarative field entries bound to a module.
//!
//! A module's derived fields are declared in one or more
//! [`DeclarationGroup`]s, each mapping a field path string to a
//! [`FieldEntry`]. Only [`FieldEntry::Computed`] and [`FieldEntry::Link`]
//! compile to steps; the other kinds reserve their path so collisions across
//! groups are still caught.
//!
//! # Example
//!
//! ```
//! use converge_runtime::declaration::{DeclarationGroup, FieldEntry, ModuleDeclaration};
//! use serde_json::json;
//!
//! let decl = ModuleDeclaration::new("counter").group(
//!     DeclarationGroup::new("derived")
//!         .field("doubled", FieldEntry::computed(["count"], |s| Ok(json!(s.number("count")? * 2.0))))
//!         .field("mirror", FieldEntry::link("doubled")),
//! );
//! assert_eq!(decl.groups().len(), 1);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use converge_foundation::{FieldPath, ModuleId};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConvergeConfigPatch;
use crate::policy::concurrency::ConcurrencyPolicyPatch;
use crate::policy::lane::LanePolicyPatch;
use crate::error::DeriveError;
use crate::state;

/// Derive function of a computed field.
pub type DeriveFn = Arc<dyn Fn(&StateView<'_>) -> Result<Value, DeriveError> + Send + Sync>;

/// Custom equality used to decide whether a derived value changed.
pub type EqualsFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// When a derivation step runs relative to the mutation that dirtied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// Runs in the same convergence pass as the triggering mutation.
    #[default]
    Immediate,
    /// Routed to the time-sliced deferred lane when time slicing is enabled.
    Deferred,
}

/// Computed field: a pure function of explicitly declared dependencies.
#[derive(Clone)]
pub struct ComputedEntry {
    /// Declared dependency paths; authoritative for scheduling.
    pub deps: Vec<String>,
    /// Produces the next value from the current state.
    pub derive: DeriveFn,
    /// Optional equality; structural equality when absent.
    pub equals: Option<EqualsFn>,
    /// Immediate or deferred.
    pub scheduling: Scheduling,
}

/// Link field: copies the value found at `from`.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    /// Source path.
    pub from: String,
    /// Immediate or deferred.
    pub scheduling: Scheduling,
}

/// One declared field.
#[derive(Clone)]
pub enum FieldEntry {
    /// Derived by a function of other fields.
    Computed(ComputedEntry),
    /// Copied from another field.
    Link(LinkEntry),
    /// Resource-backed field; reserves its path only.
    Source {
        /// Paths whose change would refresh the resource.
        deps: Vec<String>,
    },
    /// Structural node marker; reserves its path only.
    Node,
    /// List container marker; reserves its path only.
    List,
}

impl FieldEntry {
    /// Computed entry with immediate scheduling.
    pub fn computed<I, S, F>(deps: I, derive: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&StateView<'_>) -> Result<Value, DeriveError> + Send + Sync + 'static,
    {
        Self::Computed(ComputedEntry {
            deps: deps.into_iter().map(Into::into).collect(),
            derive: Arc::new(derive),
            equals: None,
            scheduling: Scheduling::Immediate,
        })
    }

    /// Link entry with immediate scheduling.
    pub fn link(from: impl Into<String>) -> Self {
        Self::Link(LinkEntry {
            from: from.into(),
            scheduling: Scheduling::Immediate,
        })
    }

    /// Resource-backed entry (path reservation only).
    pub fn source<I, S>(deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Source {
            deps: deps.into_iter().map(Into::into).collect(),
        }
    }

    /// Mark a computed or link entry as deferred.
    pub fn deferred(mut self) -> Self {
        match &mut self {
            Self::Computed(c) => c.scheduling = Scheduling::Deferred,
            Self::Link(l) => l.scheduling = Scheduling::Deferred,
            Self::Source { .. } | Self::Node | Self::List => {}
        }
        self
    }

    /// Attach a custom equality to a computed entry.
    pub fn with_equals<F>(mut self, equals: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        if let Self::Computed(c) = &mut self {
            c.equals = Some(Arc::new(equals));
        }
        self
    }

    /// Short name of the entry kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Computed(_) => "computed",
            Self::Link(_) => "link",
            Self::Source { .. } => "source",
            Self::Node => "node",
            Self::List => "list",
        }
    }
}

impl fmt::Debug for FieldEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Computed(c) => f
                .debug_struct("Computed")
                .field("deps", &c.deps)
                .field("scheduling", &c.scheduling)
                .field("custom_equals", &c.equals.is_some())
                .finish(),
            Self::Link(l) => f.debug_tuple("Link").field(l).finish(),
            Self::Source { deps } => f.debug_struct("Source").field("deps", deps).finish(),
            Self::Node => f.write_str("Node"),
            Self::List => f.write_str("List"),
        }
    }
}

/// A named set of field entries, e.g. one trait bundle.
#[derive(Debug, Clone)]
pub struct DeclarationGroup {
    name: String,
    entries: IndexMap<String, FieldEntry>,
}

impl DeclarationGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: IndexMap::new(),
        }
    }

    /// Add (or replace, within this group) the entry for `path`.
    pub fn field(mut self, path: impl Into<String>, entry: FieldEntry) -> Self {
        self.entries.insert(path.into(), entry);
        self
    }

    /// Group name, used in collision errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entries in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &FieldEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Known field paths of a state tree, used for schema-mismatch warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateShape {
    paths: IndexSet<FieldPath>,
}

impl StateShape {
    /// Shape described by the paths present in an example state.
    pub fn from_value(value: &Value) -> Self {
        let mut paths = Vec::new();
        state::collect_paths(value, &mut paths);
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    /// Shape from explicit path strings; unparseable entries are skipped.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            paths: paths
                .into_iter()
                .filter_map(|p| FieldPath::parse(p.as_ref()).ok())
                .collect(),
        }
    }

    /// Whether `path` exists in the shape.
    pub fn contains(&self, path: &FieldPath) -> bool {
        self.paths.contains(path)
    }
}

/// Per-module option patches that seed the builtin configuration layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleOptions {
    /// Convergence settings for this module.
    pub converge: ConvergeConfigPatch,
    /// Transaction lane settings for this module.
    pub lanes: LanePolicyPatch,
    /// Fan-out limits for this module's watchers.
    pub concurrency: ConcurrencyPolicyPatch,
}

/// Everything needed to compile a module's static IR.
#[derive(Debug, Clone)]
pub struct ModuleDeclaration {
    module_id: ModuleId,
    groups: Vec<DeclarationGroup>,
    shape: Option<StateShape>,
    options: ModuleOptions,
}

impl ModuleDeclaration {
    /// Empty declaration for a module.
    pub fn new(module_id: impl Into<ModuleId>) -> Self {
        Self {
            module_id: module_id.into(),
            groups: Vec::new(),
            shape: None,
            options: ModuleOptions::default(),
        }
    }

    /// Append a declaration group.
    pub fn group(mut self, group: DeclarationGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Attach a state shape for schema checks.
    pub fn shape(mut self, shape: StateShape) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Attach module-level option patches.
    pub fn options(mut self, options: ModuleOptions) -> Self {
        self.options = options;
        self
    }

    /// The module this declaration belongs to.
    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    /// Declaration groups in order.
    pub fn groups(&self) -> &[DeclarationGroup] {
        &self.groups
    }

    /// Optional state shape.
    pub fn state_shape(&self) -> Option<&StateShape> {
        self.shape.as_ref()
    }

    /// Module-level option patches.
    pub fn module_options(&self) -> &ModuleOptions {
        &self.options
    }
}

/// Read-only view of the state handed to derive functions.
///
/// When tracing is enabled every read is recorded so declared dependencies
/// can be compared with what the function actually touched.
pub struct StateView<'a> {
    root: &'a Value,
    reads: Option<RefCell<Vec<FieldPath>>>,
}

impl<'a> StateView<'a> {
    /// Untraced view.
    pub fn new(root: &'a Value) -> Self {
        Self { root, reads: None }
    }

    /// View that records the paths it is asked for.
    pub fn traced(root: &'a Value) -> Self {
        Self {
            root,
            reads: Some(RefCell::new(Vec::new())),
        }
    }

    /// Value at `path`, `null` when absent or unparseable.
    pub fn get(&self, path: &str) -> Value {
        let Ok(field) = FieldPath::parse(path) else {
            return Value::Null;
        };
        let value = state::read_value(self.root, &field).unwrap_or(Value::Null);
        if let Some(reads) = &self.reads {
            reads.borrow_mut().push(field);
        }
        value
    }

    /// Numeric value at `path`.
    pub fn number(&self, path: &str) -> Result<f64, DeriveError> {
        self.get(path)
            .as_f64()
            .ok_or_else(|| DeriveError::new(format!("`{path}` is not a number")))
    }

    /// String value at `path` (empty string when absent).
    pub fn string(&self, path: &str) -> String {
        match self.get(path) {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// The whole state, recorded as a read of every top-level field.
    pub fn root(&self) -> &'a Value {
        if let (Some(reads), Some(map)) = (&self.reads, self.root.as_object()) {
            let mut reads = reads.borrow_mut();
            for key in map.keys() {
                if let Ok(path) = FieldPath::from_segments([key.clone()]) {
                    reads.push(path);
                }
            }
        }
        self.root
    }

    /// Recorded reads (empty when untraced).
    pub fn into_reads(self) -> Vec<FieldPath> {
        self.reads.map(RefCell::into_inner).unwrap_or_default()
    }
}

/// Difference between declared dependencies and traced reads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DepsDiff {
    /// Paths read but not covered by any declared dependency.
    pub missing: Vec<String>,
    /// Declared dependencies that no read touched.
    pub unused: Vec<String>,
}

impl DepsDiff {
    /// Compare declared deps with reads; `None` when they agree.
    pub fn between(declared: &[FieldPath], reads: &[FieldPath]) -> Option<Self> {
        let mut missing: IndexSet<String> = IndexSet::new();
        for read in reads {
            if !declared.iter().any(|d| d.overlaps(read)) {
                missing.insert(read.to_string());
            }
        }
        let unused: Vec<String> = declared
            .iter()
            .filter(|d| !reads.iter().any(|r| r.overlaps(d)))
            .map(ToString::to_string)
            .collect();

        if missing.is_empty() && unused.is_empty() {
            return None;
        }
        let mut missing: Vec<String> = missing.into_iter().collect();
        missing.sort();
        Some(Self { missing, unused })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fp(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn test_traced_view_records_reads() {
        let state = json!({"a": 1, "b": {"c": "x"}});
        let view = StateView::traced(&state);
        assert_eq!(view.number("a").unwrap(), 1.0);
        assert_eq!(view.string("b.c"), "x");
        assert!(view.number("b").is_err());
        let reads: Vec<String> = view.into_reads().iter().map(ToString::to_string).collect();
        assert_eq!(reads, ["a", "b.c", "b"]);
    }

    #[test]
    fn test_untraced_view_records_nothing() {
        let state = json!({"a": 1});
        let view = StateView::new(&state);
        view.get("a");
        assert!(view.into_reads().is_empty());
    }

    #[test]
    fn test_deps_diff() {
        let declared = [fp("a"), fp("b")];
        assert_eq!(DepsDiff::between(&declared, &[fp("a.x"), fp("b")]), None);

        let diff = DepsDiff::between(&declared, &[fp("a"), fp("c")]).unwrap();
        assert_eq!(diff.missing, ["c"]);
        assert_eq!(diff.unused, ["b"]);
    }

    #[test]
    fn test_entry_builders() {
        let entry = FieldEntry::computed(["a"], |_| Ok(Value::Null))
            .deferred()
            .with_equals(|a, b| a == b);
        let FieldEntry::Computed(c) = &entry else {
            panic!("expected computed");
        };
        assert_eq!(c.scheduling, Scheduling::Deferred);
        assert!(c.equals.is_some());
        assert_eq!(entry.kind_name(), "computed");
        assert_eq!(FieldEntry::link("x").deferred().kind_name(), "link");
    }

    #[test]
    fn test_shape_from_value() {
        let shape = StateShape::from_value(&json!({"profile": {"name": "a"}}));
        assert!(shape.contains(&fp("profile.name")));
        assert!(!shape.contains(&fp("profile.age")));
    }
}
