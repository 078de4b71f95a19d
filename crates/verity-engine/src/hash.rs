//! Deterministic hashing for configuration checksums
//!
//! All hashing is seed-based and uses [`hash_seed`] for mixing, so the same
//! bytes give the same checksum on every machine. `std`'s `DefaultHasher`
//! uses random keys and cannot be used for values that cross processes.
//!
//! # Example
//!
//! ```
//! use verity_engine::hash::{checksum32, hash_bytes_with_seed};
//! use verity_engine::DEFAULT_GLOBAL_SEED;
//!
//! let h1 = hash_bytes_with_seed(b"hello", DEFAULT_GLOBAL_SEED);
//! let h2 = hash_bytes_with_seed(b"hello", DEFAULT_GLOBAL_SEED);
//! assert_eq!(h1, h2);
//!
//! assert_eq!(checksum32(b"config"), checksum32(b"config"));
//! ```

use crate::config::{hash_seed, DEFAULT_GLOBAL_SEED};

/// Hash a u64 value with a seed
pub fn hash_u64_with_seed(value: u64, seed: u64) -> u64 {
    hash_seed(seed, value, 0)
}

/// Hash a byte slice with a seed
///
/// FNV-1a inspired, with the seed as the initial state and periodic
/// [`hash_seed`] mixing.
pub fn hash_bytes_with_seed(bytes: &[u8], seed: u64) -> u64 {
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut h = seed;
    for (i, &b) in bytes.iter().enumerate() {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
        if i % 8 == 7 {
            h = hash_seed(seed, h, i as u64);
        }
    }
    hash_seed(seed, h, bytes.len() as u64)
}

/// 32-bit checksum of a byte slice
///
/// Folds the 64-bit hash so both halves contribute.
pub fn checksum32(bytes: &[u8]) -> u32 {
    let h = hash_bytes_with_seed(bytes, DEFAULT_GLOBAL_SEED);
    ((h >> 32) ^ (h & 0xffff_ffff)) as u32
}
