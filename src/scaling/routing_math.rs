//! Routing Math - Pre-allocation of virtual hash buckets
//!
//! Every partition reserves `routing_shard` virtual buckets for its subtree so
//! that it can later be split by subdividing buckets instead of rehashing the
//! documents it already holds. Pure arithmetic with 32-bit semantics.

use super::ShardId;
use crate::{Result, SplitError};

/// Upper bound for `max_routing_shards_log2`; index routing shards must fit in an i32
pub const MAX_ROUTING_SHARDS_LOG2_LIMIT: u32 = 30;

/// ceil(log2(x)), computed as `32 - leading_zeros(x - 1)`
///
/// `x <= 1` needs zero splits.
#[inline]
pub fn ceil_log2(x: u32) -> u32 {
    if x <= 1 {
        0
    } else {
        32 - (x - 1).leading_zeros()
    }
}

/// Number of routing shards a split of a partition into `num_children` reserves
///
/// `allowed_splits` is the largest `k` with `num_children * 2^k <= parent_routing_factor`;
/// the result is `num_children * 2^allowed_splits`.
///
/// Fails with `Unsplittable` once the parent has no pre-hash headroom left.
pub fn calculate_routing_shards(parent_routing_factor: u32, num_children: u32) -> Result<u32> {
    if num_children < 2 {
        return Err(SplitError::InvalidSplitCount(num_children));
    }
    let per_child = parent_routing_factor / num_children;
    if per_child == 0 {
        return Err(SplitError::Unsplittable {
            routing_factor: parent_routing_factor,
            num_children,
        });
    }

    let ceil = ceil_log2(per_child);
    // floor(log2(x)) == ceil(log2(x)) only for powers of two
    let allowed_splits = if per_child.is_power_of_two() {
        ceil
    } else {
        ceil - 1
    };
    if allowed_splits == 0 {
        return Err(SplitError::Unsplittable {
            routing_factor: parent_routing_factor,
            num_children,
        });
    }
    Ok(num_children << allowed_splits)
}

// ============================================================================
// Routing Allocation
// ============================================================================

/// Routing buckets reserved by one partition node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingAllocation {
    /// Virtual buckets reserved for this partition's subtree
    pub routing_shard: u32,
    /// Buckets per child once this partition is split
    pub routing_factor: u32,
}

impl RoutingAllocation {
    /// Allocation of an unsplit seed partition: the whole index headroom per seed
    pub fn seed(index_routing_factor: u32) -> Self {
        Self {
            routing_shard: index_routing_factor,
            routing_factor: index_routing_factor,
        }
    }

    /// Allocation shared by the children of a split into `num_children`
    pub fn for_children(parent_routing_factor: u32, num_children: u32) -> Result<Self> {
        let routing_shard = calculate_routing_shards(parent_routing_factor, num_children)?;
        Ok(Self {
            routing_shard,
            routing_factor: routing_shard / num_children,
        })
    }

    /// Whether a further split into `num_children` still has headroom
    pub fn can_split(&self, num_children: u32) -> bool {
        calculate_routing_shards(self.routing_factor, num_children).is_ok()
    }

    /// Bucket index `floor_mod(hash, routing_shard) / routing_factor`
    #[inline]
    pub fn bucket_for(&self, hash: i32) -> u32 {
        let bucket = (hash as i64).rem_euclid(self.routing_shard.max(1) as i64) as u32;
        bucket / self.routing_factor.max(1)
    }
}

// ============================================================================
// Index Routing
// ============================================================================

/// Routing shards reserved for a whole index at creation time
///
/// `num_splits = max(1, max_log2 - ceil(log2(num_seeds)))`, so every index can
/// be split at least once.
pub fn initial_routing_shards(num_seeds: u32, max_routing_shards_log2: u32) -> Result<u32> {
    if num_seeds == 0 {
        return Err(SplitError::InvalidConfig("index needs at least one seed shard".into()));
    }
    let num_splits = max_routing_shards_log2
        .saturating_sub(ceil_log2(num_seeds))
        .max(1);
    1u32.checked_shl(num_splits)
        .and_then(|f| f.checked_mul(num_seeds))
        .filter(|&shards| shards <= i32::MAX as u32)
        .ok_or_else(|| {
            SplitError::InvalidConfig(format!(
                "{} seed shards with 2^{} routing shards overflow the hash space",
                num_seeds, max_routing_shards_log2
            ))
        })
}

/// Index-level routing: picks the seed shard for a hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRouting {
    num_seeds: u32,
    routing_shards: u32,
    routing_factor: u32,
}

impl IndexRouting {
    /// Size the routing for an index with `num_seeds` seed shards
    pub fn new(num_seeds: u32, max_routing_shards_log2: u32) -> Result<Self> {
        let routing_shards = initial_routing_shards(num_seeds, max_routing_shards_log2)?;
        Ok(Self {
            num_seeds,
            routing_shards,
            routing_factor: routing_shards / num_seeds,
        })
    }

    pub fn num_seeds(&self) -> u32 {
        self.num_seeds
    }

    pub fn routing_shards(&self) -> u32 {
        self.routing_shards
    }

    /// Routing headroom every seed partition starts with
    pub fn routing_factor(&self) -> u32 {
        self.routing_factor
    }

    /// Seed shard owning `hash`
    #[inline]
    pub fn seed_for_hash(&self, hash: i32) -> ShardId {
        (hash as i64).rem_euclid(self.routing_shards as i64) as u32 / self.routing_factor
    }
}
