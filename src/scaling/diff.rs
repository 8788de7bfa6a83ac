//! Split Metadata Diff - Minimal delta between two store snapshots
//!
//! Lets split metadata ride along with cluster-state publication without
//! shipping a full snapshot on every change:
//! - flat map: deleted shard ids and upserted partitions (changed by content);
//! - leaf sets: deleted seeds and, per changed seed, removed/added members;
//! - settings and the shard-id allocation mark, when they changed.
//!
//! Round-trip law: `diff(a, b).apply(a) == b`.

use std::collections::BTreeSet;

use super::partition::PartitionMetadata;
use super::range::HashRange;
use super::store::{LeafSet, SplitMetadataStore, SplitSettings};
use super::ShardId;
use crate::{Result, SplitError};

/// Member changes of one seed's leaf set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSetDiff {
    pub seed_shard_id: ShardId,
    /// Members present before but not after
    pub removed: Vec<HashRange>,
    /// Members present after but not before; their partitions travel in the
    /// flat-map upserts
    pub added: Vec<HashRange>,
}

/// Delta that turns one split metadata snapshot into another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitMetadataDiff {
    pub(crate) partition_deletes: Vec<ShardId>,
    pub(crate) partition_upserts: Vec<PartitionMetadata>,
    pub(crate) seed_deletes: Vec<ShardId>,
    pub(crate) seed_changes: Vec<LeafSetDiff>,
    pub(crate) settings: Option<SplitSettings>,
    pub(crate) max_allocated_shard_id: Option<ShardId>,
}

impl SplitMetadataDiff {
    /// Compute the delta from `before` to `after`
    pub fn between(before: &SplitMetadataStore, after: &SplitMetadataStore) -> Self {
        let mut partition_deletes: Vec<ShardId> = before
            .partitions()
            .keys()
            .filter(|id| !after.partitions().contains_key(*id))
            .copied()
            .collect();
        partition_deletes.sort_unstable();

        let mut partition_upserts: Vec<PartitionMetadata> = after
            .partitions()
            .iter()
            .filter(|(id, p)| before.partitions().get(*id) != Some(*p))
            .map(|(_, p)| p.clone())
            .collect();
        partition_upserts.sort_by_key(|p| p.shard_id());

        let mut seed_deletes: Vec<ShardId> = before
            .seed_ranges()
            .keys()
            .filter(|seed| !after.seed_ranges().contains_key(*seed))
            .copied()
            .collect();
        seed_deletes.sort_unstable();

        let empty = LeafSet::new();
        let mut seeds: Vec<(&ShardId, &LeafSet)> = after.seed_ranges().iter().collect();
        seeds.sort_unstable_by_key(|(seed, _)| **seed);
        let mut seed_changes = Vec::new();
        for (&seed, new) in seeds {
            let old = before.seed_ranges().get(&seed).unwrap_or(&empty);
            if old == new {
                continue;
            }
            let removed: Vec<HashRange> = old.iter().filter(|r| !new.contains(r)).copied().collect();
            let added: Vec<HashRange> = new.iter().filter(|r| !old.contains(r)).copied().collect();
            seed_changes.push(LeafSetDiff {
                seed_shard_id: seed,
                removed,
                added,
            });
        }

        let settings = if before.settings() != after.settings() {
            Some(after.settings())
        } else {
            None
        };
        let max_allocated_shard_id = Some(after.max_allocated_shard_id())
            .filter(|&mark| mark != before.max_allocated_shard_id());

        Self {
            partition_deletes,
            partition_upserts,
            seed_deletes,
            seed_changes,
            settings,
            max_allocated_shard_id,
        }
    }

    /// Whether the two snapshots were identical
    pub fn is_empty(&self) -> bool {
        self.partition_deletes.is_empty()
            && self.partition_upserts.is_empty()
            && self.seed_deletes.is_empty()
            && self.seed_changes.is_empty()
            && self.settings.is_none()
            && self.max_allocated_shard_id.is_none()
    }

    pub fn partition_deletes(&self) -> &[ShardId] {
        &self.partition_deletes
    }

    pub fn partition_upserts(&self) -> &[PartitionMetadata] {
        &self.partition_upserts
    }

    pub fn seed_deletes(&self) -> &[ShardId] {
        &self.seed_deletes
    }

    pub fn seed_changes(&self) -> &[LeafSetDiff] {
        &self.seed_changes
    }

    pub fn settings(&self) -> Option<SplitSettings> {
        self.settings
    }

    pub fn max_allocated_shard_id(&self) -> Option<ShardId> {
        self.max_allocated_shard_id
    }

    /// Rebuild the `after` snapshot from `before`
    ///
    /// Works on a copy; `before` is never modified.
    pub fn apply(&self, before: &SplitMetadataStore) -> Result<SplitMetadataStore> {
        let mut store = before.clone();

        let partitions = store.partitions_mut();
        for id in &self.partition_deletes {
            partitions.remove(id);
        }
        for partition in &self.partition_upserts {
            partitions.insert(partition.shard_id(), partition.clone());
        }

        let seed_ranges = store.seed_ranges_mut();
        for seed in &self.seed_deletes {
            seed_ranges.remove(seed);
        }
        for change in &self.seed_changes {
            let leaves = seed_ranges.entry(change.seed_shard_id).or_default();
            for range in &change.removed {
                if !leaves.remove(range) {
                    return Err(SplitError::Decode(format!(
                        "diff removes leaf {:?} absent from seed {}",
                        range, change.seed_shard_id
                    )));
                }
            }
            for range in &change.added {
                leaves.insert(*range);
            }
        }
        if let Some(settings) = self.settings {
            store.set_settings(settings);
        }
        if let Some(shard_id) = self.max_allocated_shard_id {
            store.set_max_allocated_shard_id(shard_id);
        }
        store.check_integrity()?;
        Ok(store)
    }

    /// Shard ids touched by this diff
    pub fn touched_shard_ids(&self) -> BTreeSet<ShardId> {
        let mut ids: BTreeSet<ShardId> = self.partition_deletes.iter().copied().collect();
        ids.extend(self.partition_upserts.iter().map(|p| p.shard_id()));
        for change in &self.seed_changes {
            ids.extend(change.removed.iter().map(|r| r.shard_id()));
            ids.extend(change.added.iter().map(|r| r.shard_id()));
        }
        ids
    }
}

impl SplitMetadataStore {
    /// Delta from `self` to `after`
    pub fn diff(&self, after: &SplitMetadataStore) -> SplitMetadataDiff {
        SplitMetadataDiff::between(self, after)
    }

    /// Apply a delta computed against `self`
    pub fn apply_diff(&self, diff: &SplitMetadataDiff) -> Result<SplitMetadataStore> {
        diff.apply(self)
    }
}
