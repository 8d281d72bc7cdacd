//! Converge Foundation
//!
//! Core foundational types for the converge runtime: typed identifiers,
//! normalized field paths, and stable hashing for digests and sampling.

pub mod ids;
pub mod path;
pub mod stable_hash;

pub use ids::{FieldPathId, InstanceId, ModuleId, ModuleKey, StepId};
pub use path::{canonicalize_roots, FieldPath, FieldPathError, WILDCARD};
pub use stable_hash::{
    fnv1a32_ids, fnv1a64, fnv1a64_mix, fnv1a64_mix_u32, fnv1a64_path, fnv1a64_str, sample_mix,
    should_sample, FNV1A_OFFSET_BASIS_32, FNV1A_OFFSET_BASIS_64, FNV1A_PRIME_32, FNV1A_PRIME_64,
};
