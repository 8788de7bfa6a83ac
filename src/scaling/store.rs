//! Split Metadata Store - Per-index aggregate of all split trees
//!
//! Holds two views of the same partitions:
//! - a flat `shard_id -> PartitionMetadata` map for O(1) lookup by shard, which
//!   keeps committed (retired) parents for history and child lookup;
//! - per seed shard, the ordered set of *leaf* ranges (keyed by range min) for
//!   O(log n) hash-to-leaf lookup.
//!
//! Parent ranges leave the leaf set at commit time, not before, so a proposed
//! split is never observed by routing.

use std::borrow::Cow;
use std::collections::BTreeMap;

use ahash::AHashMap;
use log::{debug, error, info};

use super::partition::PartitionMetadata;
use super::range::{HashRange, HASH_SPACE_MAX};
use super::ShardId;
use crate::config::SplitConfig;
use crate::{Result, SplitError};

// ============================================================================
// Settings
// ============================================================================

/// Index-wide split settings carried with the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSettings {
    /// Seed shards the index was created with (ids `0..num_seeds`)
    pub num_seeds: u32,
    /// Routing headroom of an unsplit seed partition
    pub routing_factor: u32,
    /// Minimum width of a child range
    pub min_range_size: i32,
}

impl SplitSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_seeds == 0 {
            return Err(SplitError::InvalidConfig(
                "an index needs at least one seed shard".into(),
            ));
        }
        if self.routing_factor == 0 {
            return Err(SplitError::InvalidConfig(
                "routing_factor must be at least 1".into(),
            ));
        }
        if self.min_range_size < 0 {
            return Err(SplitError::InvalidConfig(format!(
                "min_range_size must not be negative, got {}",
                self.min_range_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Leaf Set
// ============================================================================

/// Leaf ranges of one seed shard, ordered by range min
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafSet {
    by_min: BTreeMap<i32, HashRange>,
}

impl LeafSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Range with the greatest `min <= hash`
    pub fn floor(&self, hash: i32) -> Option<&HashRange> {
        self.by_min.range(..=hash).next_back().map(|(_, range)| range)
    }

    pub fn insert(&mut self, range: HashRange) {
        self.by_min.insert(range.min(), range);
    }

    /// Remove `range` if it is the member starting at its min
    pub fn remove(&mut self, range: &HashRange) -> bool {
        if self.by_min.get(&range.min()) == Some(range) {
            self.by_min.remove(&range.min());
            true
        } else {
            false
        }
    }

    pub fn contains(&self, range: &HashRange) -> bool {
        self.by_min.get(&range.min()) == Some(range)
    }

    pub fn len(&self) -> usize {
        self.by_min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_min.is_empty()
    }

    /// Members in ascending range order
    pub fn iter(&self) -> impl Iterator<Item = &HashRange> {
        self.by_min.values()
    }

    /// First hash not covered exactly once, if the set is not a partition of the hash space
    pub fn first_gap(&self) -> Option<i32> {
        let mut expected: i64 = 0;
        for range in self.by_min.values() {
            if range.min() as i64 != expected {
                return Some(expected.min(HASH_SPACE_MAX as i64) as i32);
            }
            expected = range.max() as i64 + 1;
        }
        if expected != HASH_SPACE_MAX as i64 + 1 {
            return Some(expected.min(HASH_SPACE_MAX as i64) as i32);
        }
        None
    }
}

impl FromIterator<HashRange> for LeafSet {
    fn from_iter<I: IntoIterator<Item = HashRange>>(iter: I) -> Self {
        let mut set = LeafSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

// ============================================================================
// Split Metadata Store
// ============================================================================

/// Split metadata of one index
///
/// Mutated only by the single writer of the cluster-state update path; readers
/// work on immutable published copies (see `replication`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitMetadataStore {
    settings: SplitSettings,
    /// All partitions ever created: shard_id → PartitionMetadata
    partitions: AHashMap<ShardId, PartitionMetadata>,
    /// Current leaves per seed: seed_shard_id → LeafSet
    seed_ranges: AHashMap<ShardId, LeafSet>,
    /// Highest shard id ever handed out; aborted proposals do not lower it
    max_allocated_shard_id: ShardId,
}

impl SplitMetadataStore {
    /// Create a store with no tracked partitions
    ///
    /// Seed ids `0..num_seeds` are reserved up front, so split children never
    /// collide with a seed that is not tracked yet.
    pub fn new(settings: SplitSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            partitions: AHashMap::new(),
            seed_ranges: AHashMap::new(),
            max_allocated_shard_id: settings.num_seeds - 1,
        })
    }

    /// Create the store of a new index with seed shards `0..num_seeds`
    pub fn with_seeds(num_seeds: u32, config: &SplitConfig) -> Result<Self> {
        let routing = config.index_routing(num_seeds)?;
        let mut store = Self::new(SplitSettings {
            num_seeds,
            routing_factor: routing.routing_factor(),
            min_range_size: config.min_range_size,
        })?;
        for shard_id in 0..num_seeds {
            store.register_seed(shard_id)?;
        }
        Ok(store)
    }

    /// Rebuild a store from decoded parts, checking referential integrity
    pub(crate) fn from_parts(
        settings: SplitSettings,
        partitions: AHashMap<ShardId, PartitionMetadata>,
        seed_ranges: AHashMap<ShardId, LeafSet>,
        max_allocated_shard_id: ShardId,
    ) -> Result<Self> {
        let store = Self {
            settings,
            partitions,
            seed_ranges,
            max_allocated_shard_id,
        };
        store.check_integrity()?;
        Ok(store)
    }

    /// Settings are valid, seeds stay inside the seed id space, no id lies
    /// above the allocation mark, and every leaf range matches a flat-map
    /// partition of the same seed
    pub(crate) fn check_integrity(&self) -> Result<()> {
        self.settings
            .validate()
            .map_err(|e| SplitError::Decode(e.to_string()))?;
        let num_seeds = self.settings.num_seeds;
        if self.max_allocated_shard_id < num_seeds - 1 {
            return Err(SplitError::Decode(format!(
                "allocation mark {} is below the seed id space of {} shards",
                self.max_allocated_shard_id, num_seeds
            )));
        }
        for partition in self.partitions.values() {
            if partition.max_known_shard_id() > self.max_allocated_shard_id {
                return Err(SplitError::Decode(format!(
                    "shard {} references ids above the allocation mark {}",
                    partition.shard_id(),
                    self.max_allocated_shard_id
                )));
            }
            if partition.parent_shard_id().is_none() && partition.shard_id() >= num_seeds {
                return Err(SplitError::Decode(format!(
                    "seed shard {} is outside the index's {} seed shards",
                    partition.shard_id(),
                    num_seeds
                )));
            }
        }
        for (&seed, leaves) in self.seed_ranges.iter() {
            if seed >= num_seeds {
                return Err(SplitError::Decode(format!(
                    "leaf set of seed {} is outside the index's {} seed shards",
                    seed, num_seeds
                )));
            }
            for range in leaves.iter() {
                match self.partitions.get(&range.shard_id()) {
                    Some(p) if p.range() == range && p.seed_shard_id() == seed => {}
                    _ => {
                        return Err(SplitError::Decode(format!(
                            "leaf range of shard {} under seed {} has no matching partition",
                            range.shard_id(),
                            seed
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> SplitSettings {
        self.settings
    }

    pub(crate) fn set_settings(&mut self, settings: SplitSettings) {
        self.settings = settings;
    }

    pub(crate) fn set_max_allocated_shard_id(&mut self, shard_id: ShardId) {
        self.max_allocated_shard_id = shard_id;
    }

    pub(crate) fn partitions(&self) -> &AHashMap<ShardId, PartitionMetadata> {
        &self.partitions
    }

    pub(crate) fn partitions_mut(&mut self) -> &mut AHashMap<ShardId, PartitionMetadata> {
        &mut self.partitions
    }

    pub(crate) fn seed_ranges(&self) -> &AHashMap<ShardId, LeafSet> {
        &self.seed_ranges
    }

    pub(crate) fn seed_ranges_mut(&mut self) -> &mut AHashMap<ShardId, LeafSet> {
        &mut self.seed_ranges
    }

    /// Add an unsplit seed shard covering the whole hash space (no-op if known)
    pub fn register_seed(&mut self, shard_id: ShardId) -> Result<()> {
        if shard_id >= self.settings.num_seeds {
            return Err(SplitError::InvalidConfig(format!(
                "shard {} is not one of the index's {} seed shards",
                shard_id, self.settings.num_seeds
            )));
        }
        if self.partitions.contains_key(&shard_id) {
            return Ok(());
        }
        let seed = PartitionMetadata::seed(shard_id, self.settings.routing_factor);
        self.seed_ranges
            .entry(shard_id)
            .or_default()
            .insert(*seed.range());
        self.partitions.insert(shard_id, seed);
        Ok(())
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Partition of `shard_id`
    ///
    /// A shard without an entry was never split: it is its own seed and owns
    /// the whole hash space.
    pub fn get_partition(&self, shard_id: ShardId) -> Cow<'_, PartitionMetadata> {
        match self.partitions.get(&shard_id) {
            Some(p) => Cow::Borrowed(p),
            None => Cow::Owned(PartitionMetadata::seed(shard_id, self.settings.routing_factor)),
        }
    }

    /// Partition of `shard_id`, if tracked
    pub fn try_partition(&self, shard_id: ShardId) -> Option<&PartitionMetadata> {
        self.partitions.get(&shard_id)
    }

    /// Whether the shard has committed children
    pub fn is_parent_shard(&self, shard_id: ShardId) -> bool {
        self.partitions
            .get(&shard_id)
            .map(|p| p.is_committed())
            .unwrap_or(false)
    }

    /// Whether a split of the shard is proposed but not committed
    pub fn has_pending_split(&self, shard_id: ShardId) -> bool {
        self.partitions
            .get(&shard_id)
            .map(|p| p.is_proposed())
            .unwrap_or(false)
    }

    /// Leaf partition of `seed_shard_id` covering `hash`
    ///
    /// A miss is an invariant violation (leaf ranges not gap-free) and is fatal.
    pub fn find_leaf_for_hash(&self, seed_shard_id: ShardId, hash: i32) -> Result<&PartitionMetadata> {
        let leaves = self
            .seed_ranges
            .get(&seed_shard_id)
            .ok_or(SplitError::ShardNotFound(seed_shard_id))?;

        let found = leaves
            .floor(hash)
            .filter(|range| range.contains(hash))
            .and_then(|range| self.partitions.get(&range.shard_id()));
        match found {
            Some(partition) => Ok(partition),
            None => {
                error!(
                    "Split metadata inconsistent: no leaf of seed {} covers hash {}",
                    seed_shard_id, hash
                );
                Err(SplitError::RangeNotFound {
                    seed_shard_id,
                    hash,
                })
            }
        }
    }

    /// Leaf shard id for `hash`; a seed that was never tracked routes to itself
    pub fn leaf_shard_for_hash(&self, seed_shard_id: ShardId, hash: i32) -> Result<ShardId> {
        if !self.seed_ranges.contains_key(&seed_shard_id)
            && !self.partitions.contains_key(&seed_shard_id)
        {
            if seed_shard_id >= self.settings.num_seeds {
                return Err(SplitError::ShardNotFound(seed_shard_id));
            }
            if HashRange::full(seed_shard_id).contains(hash) {
                return Ok(seed_shard_id);
            }
            return Err(SplitError::RangeNotFound {
                seed_shard_id,
                hash,
            });
        }
        self.find_leaf_for_hash(seed_shard_id, hash)
            .map(|p| p.shard_id())
    }

    /// Children a committed parent handed its range to
    pub fn get_child_shard_ids(&self, parent_shard_id: ShardId) -> Vec<ShardId> {
        self.partitions
            .get(&parent_shard_id)
            .map(|p| p.committed_child_shard_ids().to_vec())
            .unwrap_or_default()
    }

    /// Current leaf shards of a seed, in hash order
    pub fn leaf_shard_ids(&self, seed_shard_id: ShardId) -> Vec<ShardId> {
        self.seed_ranges
            .get(&seed_shard_id)
            .map(|leaves| leaves.iter().map(|r| r.shard_id()).collect())
            .unwrap_or_default()
    }

    /// Leaf ranges of a seed, in hash order
    pub fn leaf_ranges(&self, seed_shard_id: ShardId) -> Vec<HashRange> {
        self.seed_ranges
            .get(&seed_shard_id)
            .map(|leaves| leaves.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All tracked shard ids, sorted
    pub fn split_shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.partitions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// All seed shard ids, sorted
    pub fn seed_shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.seed_ranges.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Highest shard id ever handed out, seeds and aborted children included
    pub fn max_allocated_shard_id(&self) -> ShardId {
        self.max_allocated_shard_id
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Check that the leaves of a seed partition the hash space exactly
    pub fn verify_coverage(&self, seed_shard_id: ShardId) -> Result<()> {
        let leaves = self
            .seed_ranges
            .get(&seed_shard_id)
            .ok_or(SplitError::ShardNotFound(seed_shard_id))?;
        match leaves.first_gap() {
            None => Ok(()),
            Some(hash) => Err(SplitError::RangeNotFound {
                seed_shard_id,
                hash,
            }),
        }
    }

    // ========================================================================
    // Split Protocol
    // ========================================================================

    /// Propose splitting a leaf shard into `num_children` children
    ///
    /// Children get ids `max_allocated_shard_id() + 1 ..`, stay ephemeral and
    /// are not visible to routing until `commit_split`. Returns the new child
    /// ids; they are never handed out again, even if the split is aborted.
    pub fn propose_split(&mut self, shard_id: ShardId, num_children: u32) -> Result<Vec<ShardId>> {
        let next_start = self.max_allocated_shard_id;
        let min_range_size = self.settings.min_range_size;
        let partition = self
            .partitions
            .get_mut(&shard_id)
            .ok_or(SplitError::ShardNotFound(shard_id))?;

        let children = partition.propose_split(num_children, next_start, min_range_size)?;
        let child_ids: Vec<ShardId> = children.iter().map(|c| c.shard_id()).collect();
        if let Some(&last) = child_ids.last() {
            self.max_allocated_shard_id = last;
        }
        debug!(
            "Proposed split of shard {} into {:?} (routing_shard={}, routing_factor={})",
            shard_id,
            child_ids,
            children[0].routing_shard(),
            children[0].routing_factor()
        );
        Ok(child_ids)
    }

    /// Commit a proposed split
    ///
    /// Children join the flat map and replace the parent in its seed's leaf
    /// set in one step. Re-committing an already committed shard is a no-op,
    /// so a retried commit never duplicates entries.
    pub fn commit_split(&mut self, shard_id: ShardId) -> Result<Vec<ShardId>> {
        let parent = self
            .partitions
            .get(&shard_id)
            .ok_or(SplitError::ShardNotFound(shard_id))?;

        if parent.is_committed() {
            let child_ids = parent.committed_child_shard_ids().to_vec();
            if child_ids.iter().all(|id| self.partitions.contains_key(id)) {
                debug!("Split of shard {} already committed", shard_id);
                return Ok(child_ids);
            }
            error!("Committed shard {} is missing child metadata", shard_id);
            return Err(SplitError::ParentNotFound(shard_id));
        }
        if !parent.is_proposed() {
            return Err(SplitError::NoSplitInProgress(shard_id));
        }

        let seed = parent.seed_shard_id();
        let parent_range = *parent.range();
        let leaves = match self.seed_ranges.get(&seed) {
            Some(leaves) if leaves.contains(&parent_range) => leaves,
            _ => {
                error!(
                    "Shard {} is not a current leaf of seed {}; refusing to commit",
                    shard_id, seed
                );
                return Err(SplitError::ParentNotFound(shard_id));
            }
        };

        // Build the replacement leaf set before touching anything
        let mut next_leaves = leaves.clone();
        next_leaves.remove(&parent_range);
        for child in parent.ephemeral_children() {
            next_leaves.insert(*child.range());
        }

        let children = match self.partitions.get_mut(&shard_id) {
            Some(parent) => parent.take_committed_children()?,
            None => return Err(SplitError::ShardNotFound(shard_id)),
        };
        let child_ids: Vec<ShardId> = children.iter().map(|c| c.shard_id()).collect();
        for child in children {
            self.partitions.insert(child.shard_id(), child);
        }
        self.seed_ranges.insert(seed, next_leaves);

        info!(
            "Committed split of shard {} (seed {}) into {:?}",
            shard_id, seed, child_ids
        );
        Ok(child_ids)
    }

    /// Abort a proposed split before commit, returning the dropped child ids
    pub fn abort_split(&mut self, shard_id: ShardId) -> Result<Vec<ShardId>> {
        let partition = self
            .partitions
            .get_mut(&shard_id)
            .ok_or(SplitError::ShardNotFound(shard_id))?;
        let dropped: Vec<ShardId> = partition
            .abort_split()?
            .iter()
            .map(|c| c.shard_id())
            .collect();
        debug!("Aborted split of shard {}, dropped {:?}", shard_id, dropped);
        Ok(dropped)
    }
}
