//! Errors raised while compiling declarations and driving the runtime.
//!
//! # Error Categories
//!
//! - **Declaration errors** (fatal for the module's instantiation):
//!   [`Error::DuplicateFieldPath`], [`Error::MissingDeps`],
//!   [`Error::InvalidFieldPath`], [`Error::WildcardTarget`],
//!   [`Error::SelfLink`], [`Error::LinkCycle`], [`Error::ImmediateCycle`]
//! - **Lookup errors**: [`Error::UnknownInstance`], [`Error::DuplicateInstance`]
//! - **Usage errors**: [`Error::NestedTransaction`]
//! - **Watcher errors**: [`Error::Backpressure`], [`Error::WatcherClosed`],
//!   [`Error::NoAsyncRuntime`]
//!
//! # Error Handling Policy
//!
//! Declaration errors are programmer errors and always name the offending
//! path (and, for collisions, both declaring groups). Runtime degradation is
//! *not* an error: a convergence pass or tick that hits a cap reports a
//! degrade reason instead (see [`crate::converge::DegradeReason`]). Failures
//! inside derive functions are values of [`DeriveError`].

use converge_foundation::{FieldPathError, ModuleKey};
use thiserror::Error;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by compilation and runtime bookkeeping.
#[derive(Debug, Error)]
pub enum Error {
    /// Two declaration groups both claim the same field path.
    ///
    /// Every field path may be owned by exactly one entry across all groups
    /// bound to a module, including non-derivation kinds that only reserve
    /// their path.
    #[error("field path `{path}` declared by both `{first_group}` and `{second_group}`")]
    DuplicateFieldPath {
        /// The contested path.
        path: String,
        /// Group that declared the path first.
        first_group: String,
        /// Group that declared it again.
        second_group: String,
    },

    /// A computed entry was declared without explicit dependencies.
    ///
    /// Dependencies are the sole source of truth for scheduling, so an empty
    /// or missing list would never re-trigger the step.
    #[error("computed field `{path}` must declare explicit deps")]
    MissingDeps {
        /// The computed field.
        path: String,
    },

    /// A declared path or dependency reference could not be normalized.
    #[error("invalid field path `{raw}` in {context}: {source}")]
    InvalidFieldPath {
        /// The raw string as declared.
        raw: String,
        /// Where the reference appeared (entry path and role).
        context: String,
        /// Normalization failure.
        #[source]
        source: FieldPathError,
    },

    /// A computed or link output addresses a wildcard (list item) location.
    #[error("derived field `{path}` cannot target a list item wildcard")]
    WildcardTarget {
        /// The offending output path.
        path: String,
    },

    /// A link copies from its own output path.
    #[error("link `{path}` reads from itself")]
    SelfLink {
        /// The link's output path.
        path: String,
    },

    /// A chain of links returns to a field it started from.
    #[error("link cycle detected at `{path}`")]
    LinkCycle {
        /// First field found on the cycle.
        path: String,
    },

    /// Immediate-scheduling steps form a dependency cycle.
    ///
    /// Cycles that pass through a deferred step are tolerated and bounded by
    /// runtime caps; cycles made only of immediate steps cannot be ordered.
    #[error("cycle among immediate steps: {steps:?}")]
    ImmediateCycle {
        /// Output paths of the steps left unordered.
        steps: Vec<String>,
    },

    /// A module instance was referenced that was never registered.
    #[error("unknown module instance: {0}")]
    UnknownInstance(ModuleKey),

    /// A module instance was registered twice.
    #[error("module instance already registered: {0}")]
    DuplicateInstance(ModuleKey),

    /// A transaction was opened while another is active on the same instance.
    #[error("nested transaction on {0}")]
    NestedTransaction(ModuleKey),

    /// A watcher's channel is full; `try_dispatch` does not wait.
    #[error("watcher `{action}` on {key} is at capacity")]
    Backpressure {
        /// Instance the watcher belongs to.
        key: ModuleKey,
        /// Action tag of the watcher.
        action: String,
    },

    /// Watchers run as tokio tasks; none was reachable.
    #[error("watcher `{action}` needs a tokio runtime")]
    NoAsyncRuntime {
        /// Action tag of the watcher.
        action: String,
    },

    /// A watcher was cancelled or its task ended.
    #[error("watcher `{action}` on {key} is closed")]
    WatcherClosed {
        /// Instance the watcher belongs to.
        key: ModuleKey,
        /// Action tag of the watcher.
        action: String,
    },
}

/// Failure of a computed field's derive function.
///
/// Returned by derive closures instead of panicking; the executor turns it
/// into a `runtime_error` degrade with this summary attached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DeriveError {
    /// Human-readable description.
    pub message: String,
}

impl DeriveError {
    /// Create a derive error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Message carried by a panic payload, if it is a string.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return Some((*s).to_string());
    }
    payload.downcast_ref::<String>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_strings() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()).as_deref(), Some("boom 1"));

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), None);
    }

    #[test]
    fn test_duplicate_path_names_both_groups() {
        let err = Error::DuplicateFieldPath {
            path: "profile.fullName".into(),
            first_group: "name".into(),
            second_group: "display".into(),
        };
        let message = err.to_string();
        assert!(message.contains("profile.fullName"));
        assert!(message.contains("`name`") && message.contains("`display`"));
    }
}
