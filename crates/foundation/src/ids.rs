//! Identifiers for module instances, compiled field paths and steps.
//!
//! Module and instance identifiers are typed string wrappers; compiled
//! identifiers ([`FieldPathId`], [`StepId`]) are dense zero-based indexes
//! into the arrays of one static IR generation.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Creates a new identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

macro_rules! define_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// The id as an array index.
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            /// Build an id from an array index.
            #[inline]
            pub fn from_index(index: usize) -> Self {
                debug_assert!(index <= u32::MAX as usize, "compiled index exceeds u32");
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a module definition (shared by its instances).
    ModuleId
);

define_id!(
    /// Identifier of one instance of a module.
    InstanceId
);

define_index!(
    /// Dense id of a field path within one static IR generation.
    FieldPathId
);

define_index!(
    /// Dense id of a compiled step within one static IR generation.
    StepId
);

/// Address of a module instance: `(moduleId, instanceId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    /// Module the instance belongs to.
    pub module_id: ModuleId,
    /// Instance within the module.
    pub instance_id: InstanceId,
}

impl ModuleKey {
    /// Create a key from its two parts.
    pub fn new(module_id: impl Into<ModuleId>, instance_id: impl Into<InstanceId>) -> Self {
        Self {
            module_id: module_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module_id, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_key_display() {
        let key = ModuleKey::new("form", "main");
        assert_eq!(key.to_string(), "form::main");
        assert_eq!(key.module_id.as_str(), "form");
    }

    #[test]
    fn test_index_ids_round_trip_indexes() {
        let id = StepId::from_index(7);
        assert_eq!(id.index(), 7);
        assert_eq!(FieldPathId(3).to_string(), "3");
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
    }
}
