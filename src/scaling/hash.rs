//! Routing Hash - Turns routing keys into 32-bit routing hashes
//!
//! Hashing is pluggable through `RoutingHasher`:
//! - Murmur3 (x86_32, seed 0): the stable default, identical across builds;
//! - AHash with fixed seeds, folded to 32 bits: faster, but tied to the ahash
//!   version, so indices persisted with it must keep the same crate version.

use std::hash::{BuildHasher, Hasher};

use serde::{Deserialize, Serialize};

// ============================================================================
// Routing Key
// ============================================================================

/// Routing value extracted from a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingKey {
    Int(i64),
    UInt(u64),
    Str(String),
    Bytes(Vec<u8>),
}

impl RoutingKey {
    /// Bytes fed to the hash function
    ///
    /// Numbers hash as their decimal string; strings hash as UTF-16LE code
    /// units, so `Int(42)` and `Str("42")` land on the same shard.
    pub fn routing_bytes(&self) -> Vec<u8> {
        match self {
            RoutingKey::Int(v) => utf16_le(&v.to_string()),
            RoutingKey::UInt(v) => utf16_le(&v.to_string()),
            RoutingKey::Str(s) => utf16_le(s),
            RoutingKey::Bytes(b) => b.clone(),
        }
    }
}

impl From<i64> for RoutingKey {
    fn from(v: i64) -> Self {
        RoutingKey::Int(v)
    }
}

impl From<u64> for RoutingKey {
    fn from(v: u64) -> Self {
        RoutingKey::UInt(v)
    }
}

impl From<&str> for RoutingKey {
    fn from(s: &str) -> Self {
        RoutingKey::Str(s.to_string())
    }
}

impl From<String> for RoutingKey {
    fn from(s: String) -> Self {
        RoutingKey::Str(s)
    }
}

impl From<Vec<u8>> for RoutingKey {
    fn from(b: Vec<u8>) -> Self {
        RoutingKey::Bytes(b)
    }
}

fn utf16_le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

// ============================================================================
// Hashers
// ============================================================================

/// Hash function applied to routing keys
pub trait RoutingHasher: Send + Sync {
    fn hash(&self, key: &[u8]) -> i32;
}

impl<F> RoutingHasher for F
where
    F: Fn(&[u8]) -> i32 + Send + Sync,
{
    fn hash(&self, key: &[u8]) -> i32 {
        self(key)
    }
}

/// MurmurHash3 x86_32
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k: u32 = 0;
    if tail.len() >= 3 {
        k ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k ^= tail[0] as u32;
        h ^= k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Murmur3 x86_32 with seed 0
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Hasher;

impl RoutingHasher for Murmur3Hasher {
    fn hash(&self, key: &[u8]) -> i32 {
        murmur3_32(key, 0) as i32
    }
}

/// AHash with fixed seeds so every node agrees on the result
#[derive(Clone)]
pub struct AHashRouting {
    state: ahash::RandomState,
}

const AHASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

impl AHashRouting {
    pub fn new() -> Self {
        Self {
            state: ahash::RandomState::with_seeds(
                AHASH_SEEDS[0],
                AHASH_SEEDS[1],
                AHASH_SEEDS[2],
                AHASH_SEEDS[3],
            ),
        }
    }
}

impl Default for AHashRouting {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingHasher for AHashRouting {
    fn hash(&self, key: &[u8]) -> i32 {
        let mut hasher = self.state.build_hasher();
        hasher.write(key);
        let h = hasher.finish();
        ((h >> 32) ^ h) as u32 as i32
    }
}

/// Configurable hash function choice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    #[default]
    Murmur3,
    AHash,
}

impl HashFunction {
    pub fn build(&self) -> Box<dyn RoutingHasher> {
        match self {
            HashFunction::Murmur3 => Box::new(Murmur3Hasher),
            HashFunction::AHash => Box::new(AHashRouting::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_known_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    #[test]
    fn test_routing_bytes() {
        assert_eq!(RoutingKey::from("ab").routing_bytes(), vec![b'a', 0, b'b', 0]);
        assert_eq!(
            RoutingKey::Int(42).routing_bytes(),
            RoutingKey::from("42").routing_bytes()
        );
        assert_eq!(
            RoutingKey::UInt(7).routing_bytes(),
            RoutingKey::Int(7).routing_bytes()
        );
        assert_eq!(RoutingKey::Bytes(vec![1, 2, 3]).routing_bytes(), vec![1, 2, 3]);
        // non-BMP characters become surrogate pairs
        assert_eq!(RoutingKey::from("😀").routing_bytes().len(), 4);
    }

    #[test]
    fn test_hashers_are_deterministic() {
        let key = RoutingKey::from("user-123").routing_bytes();
        for function in [HashFunction::Murmur3, HashFunction::AHash] {
            let a = function.build();
            let b = function.build();
            assert_eq!(a.hash(&key), b.hash(&key));
        }
        assert_eq!(
            Murmur3Hasher.hash(&key),
            murmur3_32(&key, 0) as i32
        );
    }

    #[test]
    fn test_closure_hasher() {
        let constant = |_: &[u8]| 17i32;
        assert_eq!(constant.hash(b"anything"), 17);
    }

    #[test]
    fn test_hash_function_serde() {
        assert_eq!(serde_json::to_string(&HashFunction::AHash).unwrap(), "\"ahash\"");
        let parsed: HashFunction = serde_json::from_str("\"murmur3\"").unwrap();
        assert_eq!(parsed, HashFunction::Murmur3);
        assert_eq!(HashFunction::default(), HashFunction::Murmur3);
    }
}
