//! Layered policy resolution.
//!
//! Every policy is resolved from the same four layers, lowest first:
//!
//! | scope | source |
//! |---|---|
//! | `builtin` | compiled-in defaults, seeded by the module's own options |
//! | `runtime_default` | runtime-wide overrides |
//! | `runtime_module` | runtime overrides keyed by module id |
//! | `provider` | overrides installed by the embedding host |
//!
//! A resolved record reports the scope of the last layer that set at least
//! one field, so tooling can explain where an effective value came from.

pub mod concurrency;
pub mod lane;

use serde::{Deserialize, Serialize};

/// Origin layer of a resolved configuration value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConfigScope {
    /// Compiled-in defaults (and module options).
    #[default]
    Builtin,
    /// Runtime-wide overrides.
    RuntimeDefault,
    /// Runtime overrides for one module.
    RuntimeModule,
    /// Host provider overrides.
    Provider,
}

/// A partial configuration that can be laid over a resolved value.
pub trait ConfigPatch {
    /// The fully-resolved configuration this patch modifies.
    type Target;

    /// Apply every set field; returns whether any field was set.
    fn apply_to(&self, target: &mut Self::Target) -> bool;
}

/// A resolved value together with the layer it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved<T> {
    /// Effective value.
    pub value: T,
    /// Last layer that changed the value.
    pub config_scope: ConfigScope,
}

/// The three override layers above `builtin`, in precedence order.
#[derive(Debug)]
pub struct Layers<'a, P> {
    /// Runtime-wide overrides.
    pub runtime_default: Option<&'a P>,
    /// Runtime overrides for this module.
    pub runtime_module: Option<&'a P>,
    /// Provider overrides.
    pub provider: Option<&'a P>,
}

impl<P> Clone for Layers<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Layers<'_, P> {}

impl<'a, P> Layers<'a, P> {
    /// Iterate the layers lowest-precedence first.
    pub fn iter(&self) -> impl Iterator<Item = (ConfigScope, &'a P)> {
        [
            (ConfigScope::RuntimeDefault, self.runtime_default),
            (ConfigScope::RuntimeModule, self.runtime_module),
            (ConfigScope::Provider, self.provider),
        ]
        .into_iter()
        .filter_map(|(scope, patch)| patch.map(|p| (scope, p)))
    }
}

/// Resolve `builtin` (already seeded by module options) through the layers.
pub fn resolve_layers<P>(
    builtin: P::Target,
    module: &P,
    layers: Layers<'_, P>,
) -> Resolved<P::Target>
where
    P: ConfigPatch,
{
    let mut value = builtin;
    module.apply_to(&mut value);
    let mut config_scope = ConfigScope::Builtin;
    for (scope, patch) in layers.iter() {
        if patch.apply_to(&mut value) {
            config_scope = scope;
        }
    }
    Resolved {
        value,
        config_scope,
    }
}

/// Overwrite `slot` when `patch` holds a value; reports whether it did.
pub(crate) fn set<T: Clone>(slot: &mut T, patch: &Option<T>) -> bool {
    match patch {
        Some(v) => {
            *slot = v.clone();
            true
        }
        None => false,
    }
}
