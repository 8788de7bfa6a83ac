//! Routing Resolver - Maps routing keys to leaf shards
//!
//! Read path only:
//! - hash the routing key with the configured `RoutingHasher`
//! - pick the seed shard from the index routing (when known)
//! - floor-look-up the leaf range of that seed covering the hash
//!
//! Works on immutable snapshots and never mutates or locks anything, so any
//! number of readers can resolve concurrently.

use super::hash::{RoutingHasher, RoutingKey};
use super::routing_math::IndexRouting;
use super::store::SplitMetadataStore;
use super::ShardId;
use crate::config::SplitConfig;
use crate::{Result, SplitError};

// ============================================================================
// Hash Routing
// ============================================================================

/// Anything that can map `(seed, hash)` to a leaf shard
///
/// Implemented by the metadata store and by published snapshots; test
/// harnesses implement it to compare alternative routing tables against the
/// same resolver.
pub trait HashRouting {
    fn leaf_for_hash(&self, seed_shard_id: ShardId, hash: i32) -> Result<ShardId>;
}

impl HashRouting for SplitMetadataStore {
    fn leaf_for_hash(&self, seed_shard_id: ShardId, hash: i32) -> Result<ShardId> {
        self.leaf_shard_for_hash(seed_shard_id, hash)
    }
}

/// Fold an arbitrary 32-bit hash into `[0, i32::MAX)`
#[inline]
pub fn normalize_hash(hash: i32) -> i32 {
    hash.rem_euclid(i32::MAX)
}

// ============================================================================
// Routing Resolver
// ============================================================================

/// Resolves routing keys to leaf shards
pub struct RoutingResolver {
    hasher: Box<dyn RoutingHasher>,
    index_routing: Option<IndexRouting>,
}

impl RoutingResolver {
    /// Create a resolver using `hasher` for routing keys
    pub fn new<H: RoutingHasher + 'static>(hasher: H) -> Self {
        Self {
            hasher: Box::new(hasher),
            index_routing: None,
        }
    }

    /// Resolver with the configured hash function
    pub fn from_config(config: &SplitConfig) -> Self {
        Self {
            hasher: config.hash_function.build(),
            index_routing: None,
        }
    }

    /// Enable seed selection for `route`
    pub fn with_index_routing(mut self, index_routing: IndexRouting) -> Self {
        self.index_routing = Some(index_routing);
        self
    }

    pub fn index_routing(&self) -> Option<&IndexRouting> {
        self.index_routing.as_ref()
    }

    pub fn hash_key(&self, key: &RoutingKey) -> i32 {
        self.hasher.hash(&key.routing_bytes())
    }

    /// Leaf shard of `seed_shard_id` owning raw routing bytes
    pub fn resolve<R: HashRouting + ?Sized>(
        &self,
        snapshot: &R,
        seed_shard_id: ShardId,
        key: &[u8],
    ) -> Result<ShardId> {
        self.resolve_hash(snapshot, seed_shard_id, self.hasher.hash(key))
    }

    /// Leaf shard of `seed_shard_id` owning a routing key
    pub fn resolve_key<R: HashRouting + ?Sized>(
        &self,
        snapshot: &R,
        seed_shard_id: ShardId,
        key: &RoutingKey,
    ) -> Result<ShardId> {
        self.resolve_hash(snapshot, seed_shard_id, self.hash_key(key))
    }

    /// Leaf shard of `seed_shard_id` owning an already computed hash
    pub fn resolve_hash<R: HashRouting + ?Sized>(
        &self,
        snapshot: &R,
        seed_shard_id: ShardId,
        hash: i32,
    ) -> Result<ShardId> {
        snapshot.leaf_for_hash(seed_shard_id, normalize_hash(hash))
    }

    /// Seed and leaf selection in one step
    ///
    /// Requires the index routing (`with_index_routing`).
    pub fn route<R: HashRouting + ?Sized>(&self, snapshot: &R, key: &RoutingKey) -> Result<ShardId> {
        let index_routing = self.index_routing.as_ref().ok_or_else(|| {
            SplitError::InvalidConfig("resolver has no index routing to pick a seed shard".into())
        })?;
        let hash = self.hash_key(key);
        let seed = index_routing.seed_for_hash(hash);
        self.resolve_hash(snapshot, seed, hash)
    }

    /// Routing bucket of the seed partition for `hash`
    ///
    /// `floor_mod(hash, routing_shard) / routing_factor` over the seed's own
    /// allocation; identifies which child subtree a bucket-model split would
    /// send the hash to.
    pub fn seed_bucket(&self, store: &SplitMetadataStore, seed_shard_id: ShardId, hash: i32) -> u32 {
        store.get_partition(seed_shard_id).routing().bucket_for(hash)
    }
}

impl std::fmt::Debug for RoutingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingResolver")
            .field("index_routing", &self.index_routing)
            .finish_non_exhaustive()
    }
}
