//! Stable hashing utilities for digests, dirty-set keys and sampling.
//!
//! Every identifier the runtime derives (static IR digests, dirty root keys,
//! sampled tick decisions) must be a deterministic consequence of explicit
//! inputs. These helpers provide FNV-1a in 64-bit and 32-bit widths plus the
//! integer mixer used for deterministic sampling.
//!
//! NOTE: FNV-1a is **not** cryptographically secure.
//! It is used strictly for stable identifiers and deterministic derivations.

/// 64-bit FNV-1a offset basis.
pub const FNV1A_OFFSET_BASIS_64: u64 = 0xcbf29ce484222325;
/// 64-bit FNV-1a prime.
pub const FNV1A_PRIME_64: u64 = 0x0000_0100_0000_01B3;

/// 32-bit FNV-1a offset basis.
pub const FNV1A_OFFSET_BASIS_32: u32 = 0x811c_9dc5;
/// 32-bit FNV-1a prime.
pub const FNV1A_PRIME_32: u32 = 0x0100_0193;

/// Mix bytes into an existing FNV-1a 64-bit hash state.
///
/// For each byte, XOR it into the hash and multiply by the FNV prime.
///
/// # Example
/// ```
/// use converge_foundation::stable_hash::{fnv1a64_mix, FNV1A_OFFSET_BASIS_64};
///
/// let hash = FNV1A_OFFSET_BASIS_64;
/// let hash = fnv1a64_mix(hash, b"profile");
/// let hash = fnv1a64_mix(hash, b"fullName");
/// ```
#[inline]
pub const fn fnv1a64_mix(mut hash: u64, bytes: &[u8]) -> u64 {
    let mut i = 0usize;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV1A_PRIME_64);
        i += 1;
    }
    hash
}

/// Mix a `u32` (little-endian bytes) into a 64-bit hash state.
#[inline]
pub const fn fnv1a64_mix_u32(hash: u64, value: u32) -> u64 {
    fnv1a64_mix(hash, &value.to_le_bytes())
}

/// Hash an arbitrary byte slice with FNV-1a 64-bit.
#[inline]
pub const fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a64_mix(FNV1A_OFFSET_BASIS_64, bytes)
}

/// Hash a UTF-8 string with FNV-1a 64-bit.
#[inline]
pub const fn fnv1a64_str(s: &str) -> u64 {
    fnv1a64(s.as_bytes())
}

/// Hash path segments, inserting `.` between them.
///
/// ```
/// # use converge_foundation::stable_hash::{fnv1a64_path, fnv1a64_str};
/// assert_eq!(fnv1a64_path(&["profile", "fullName"]), fnv1a64_str("profile.fullName"));
/// ```
#[inline]
pub const fn fnv1a64_path(parts: &[&str]) -> u64 {
    let mut h = FNV1A_OFFSET_BASIS_64;

    let mut i = 0usize;
    while i < parts.len() {
        h = fnv1a64_mix(h, parts[i].as_bytes());
        if i + 1 < parts.len() {
            h = fnv1a64_mix(h, b".");
        }
        i += 1;
    }

    h
}

/// Hash a list of dense ids with FNV-1a 32-bit, one XOR per id.
///
/// Used as the key hash of a canonical dirty root set.
pub fn fnv1a32_ids(ids: &[u32]) -> u32 {
    let mut hash = FNV1A_OFFSET_BASIS_32;
    for id in ids {
        hash ^= *id;
        hash = hash.wrapping_mul(FNV1A_PRIME_32);
    }
    hash
}

/// Integer mixer for deterministic sampling decisions.
#[inline]
pub const fn sample_mix(x: u32) -> u32 {
    (x ^ 0x9e37_79b9).wrapping_mul(0x85eb_ca6b)
}

/// Deterministically decide whether `seq` falls into a sample of `rate`.
///
/// Rates outside `(0, 1)` are clamped: `<= 0` never samples, `>= 1` always
/// samples. The same `(seq, rate)` pair always yields the same answer.
pub fn should_sample(seq: u64, rate: f64) -> bool {
    if !rate.is_finite() || rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    let h = sample_mix(seq as u32);
    (h as f64) / (u32::MAX as f64) < rate
}
