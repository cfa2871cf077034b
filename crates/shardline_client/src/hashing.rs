//! Key-to-shard strategy.
//!
//! A key is hashed once with a fixed 32-bit function that must match the
//! server's partitioning bit-for-bit; the resulting code is then tested against
//! each shard's inclusive hash range.

use crate::model::Shard;

/// 32-bit partitioning hash: the low 32 bits of XXH3-64 over the key bytes.
pub fn xxh332(key: &str) -> u32 {
    xxhash_rust::xxh3::xxh3_64(key.as_bytes()) as u32
}

/// Resolves keys to predicates over shard assignments.
#[derive(Clone, Copy, Debug)]
pub struct ShardStrategy {
    hash: fn(&str) -> u32,
}

impl Default for ShardStrategy {
    fn default() -> Self {
        Self { hash: xxh332 }
    }
}

impl ShardStrategy {
    /// Build a strategy over a custom hash function (tests, alternate partitioners).
    pub fn with_hash(hash: fn(&str) -> u32) -> Self {
        Self { hash }
    }

    /// Hash `key` and return the predicate selecting its owning shard.
    pub fn resolve(&self, key: &str) -> KeyRoute {
        KeyRoute {
            code: (self.hash)(key),
        }
    }
}

/// Hashed key, ready to be tested against shard ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRoute {
    code: u32,
}

impl KeyRoute {
    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn matches(&self, shard: &Shard) -> bool {
        shard.hash_range.contains(self.code)
    }
}
