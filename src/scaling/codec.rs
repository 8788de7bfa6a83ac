//! Binary wire format for split metadata
//!
//! Counts, ids and range bounds are unsigned LEB128 varints. Collections are
//! written as a count followed by each element, so a full snapshot and a
//! persisted diff encode their elements identically.
//!
//! Layout:
//! ```text
//! Partition:
//! - shard_id, seed_shard_id, min, max: vint
//! - ephemeral child count: vint, then each child (Partition)
//! - parent_shard_id + 1: vlong (0 = seed)
//! - routing_shard, routing_factor: vint
//! - committed child count: vint, then each child id: vint
//!
//! Store:
//! - partition count, then each Partition (ascending shard id)
//! - seed count, then each (seed_shard_id, leaf count, leaf Partitions by min)
//! - num_seeds, routing_factor, min_range_size: vint
//! - max_allocated_shard_id: vint
//!
//! Diff:
//! - deleted shard count + ids, upserted Partition count + Partitions
//! - deleted seed count + ids
//! - changed seed count, then each (seed_shard_id,
//!   removed count + (shard_id, min, max), added count + (shard_id, min, max))
//! - settings flag: u8, then num_seeds, routing_factor, min_range_size when set
//! - allocation flag: u8, then max_allocated_shard_id when set
//! ```

use ahash::AHashMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::diff::{LeafSetDiff, SplitMetadataDiff};
use super::partition::{PartitionMetadata, SplitState};
use super::range::HashRange;
use super::routing_math::RoutingAllocation;
use super::store::{LeafSet, SplitMetadataStore, SplitSettings};
use super::ShardId;
use crate::{Result, SplitError};

// ============================================================================
// Streams
// ============================================================================

/// Growable output buffer with varint helpers
#[derive(Debug, Default)]
pub struct StreamOutput {
    buf: BytesMut,
}

impl StreamOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_vint(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn write_vlong(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    /// Hash bounds are never negative; they travel as plain vints
    pub fn write_hash(&mut self, value: i32) {
        debug_assert!(value >= 0, "negative hash bound {}", value);
        self.write_vint(value as u32);
    }

    pub fn write_count(&mut self, count: usize) -> Result<()> {
        let count = u32::try_from(count)
            .map_err(|_| SplitError::Decode(format!("collection of {} elements is too large", count)))?;
        self.write_vint(count);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over an encoded buffer
#[derive(Debug)]
pub struct StreamInput<'a> {
    buf: &'a [u8],
}

impl<'a> StreamInput<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if !self.buf.has_remaining() {
            return Err(SplitError::Decode("unexpected end of input".into()));
        }
        Ok(self.buf.get_u8())
    }

    pub fn read_vint(&mut self) -> Result<u32> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 28 && byte & 0xf0 != 0 {
                return Err(SplitError::Decode("vint overflows 32 bits".into()));
            }
            result |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_vlong(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte & 0xfe != 0 {
                return Err(SplitError::Decode("vlong overflows 64 bits".into()));
            }
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_hash(&mut self) -> Result<i32> {
        let value = self.read_vint()?;
        i32::try_from(value).map_err(|_| SplitError::Decode(format!("hash bound {} out of range", value)))
    }

    /// Element count; every element takes at least one byte
    pub fn read_count(&mut self) -> Result<usize> {
        let count = self.read_vint()? as usize;
        if count > self.remaining() {
            return Err(SplitError::Decode(format!(
                "count {} exceeds {} remaining bytes",
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Fail if anything is left unread
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(SplitError::Decode(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Writeable
// ============================================================================

/// Types with a binary wire representation
pub trait Writeable: Sized {
    fn write_to(&self, out: &mut StreamOutput) -> Result<()>;

    fn read_from(input: &mut StreamInput<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Result<Bytes> {
        let mut out = StreamOutput::with_capacity(256);
        self.write_to(&mut out)?;
        Ok(out.freeze())
    }

    /// Decode a complete buffer; trailing bytes are an error
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut input = StreamInput::new(bytes);
        let value = Self::read_from(&mut input)?;
        input.finish()?;
        Ok(value)
    }
}

impl Writeable for HashRange {
    fn write_to(&self, out: &mut StreamOutput) -> Result<()> {
        out.write_vint(self.shard_id());
        out.write_hash(self.min());
        out.write_hash(self.max());
        Ok(())
    }

    fn read_from(input: &mut StreamInput<'_>) -> Result<Self> {
        let shard_id = input.read_vint()?;
        let min = input.read_hash()?;
        let max = input.read_hash()?;
        HashRange::new(shard_id, min, max)
    }
}

impl Writeable for PartitionMetadata {
    fn write_to(&self, out: &mut StreamOutput) -> Result<()> {
        out.write_vint(self.shard_id());
        out.write_vint(self.seed_shard_id());
        out.write_hash(self.range().min());
        out.write_hash(self.range().max());

        let children = self.ephemeral_children();
        out.write_count(children.len())?;
        for child in children {
            child.write_to(out)?;
        }

        out.write_vlong(self.parent_shard_id().map_or(0, |p| p as u64 + 1));
        out.write_vint(self.routing_shard());
        out.write_vint(self.routing_factor());

        let committed = self.committed_child_shard_ids();
        out.write_count(committed.len())?;
        for &id in committed {
            out.write_vint(id);
        }
        Ok(())
    }

    fn read_from(input: &mut StreamInput<'_>) -> Result<Self> {
        read_partition(input, false)
    }
}

/// Ephemeral children are always leaves, so nesting stops at one level
fn read_partition(input: &mut StreamInput<'_>, nested: bool) -> Result<PartitionMetadata> {
    let shard_id = input.read_vint()?;
    let seed_shard_id = input.read_vint()?;
    let min = input.read_hash()?;
    let max = input.read_hash()?;
    let range = HashRange::new(shard_id, min, max)?;

    let num_children = input.read_count()?;
    if nested && num_children > 0 {
        return Err(SplitError::Decode(format!(
            "ephemeral child {} carries its own children",
            shard_id
        )));
    }
    let mut children = Vec::with_capacity(num_children);
    for _ in 0..num_children {
        children.push(read_partition(input, true)?);
    }

    let parent_shard_id = match input.read_vlong()? {
        0 => None,
        encoded => Some(ShardId::try_from(encoded - 1).map_err(|_| {
            SplitError::Decode(format!("parent shard id {} out of range", encoded - 1))
        })?),
    };
    let routing = RoutingAllocation {
        routing_shard: input.read_vint()?,
        routing_factor: input.read_vint()?,
    };

    let num_committed = input.read_count()?;
    let mut child_shard_ids = Vec::with_capacity(num_committed);
    for _ in 0..num_committed {
        child_shard_ids.push(input.read_vint()?);
    }

    let state = match (children.is_empty(), child_shard_ids.is_empty()) {
        (true, true) => SplitState::Leaf,
        (false, true) => SplitState::Proposed { children },
        (true, false) => SplitState::Committed { child_shard_ids },
        (false, false) => {
            return Err(SplitError::Decode(format!(
                "shard {} is both proposed and committed",
                shard_id
            )))
        }
    };
    PartitionMetadata::from_parts(seed_shard_id, parent_shard_id, range, routing, state)
}

fn write_settings(settings: &SplitSettings, out: &mut StreamOutput) {
    out.write_vint(settings.num_seeds);
    out.write_vint(settings.routing_factor);
    out.write_hash(settings.min_range_size);
}

fn read_settings(input: &mut StreamInput<'_>) -> Result<SplitSettings> {
    Ok(SplitSettings {
        num_seeds: input.read_vint()?,
        routing_factor: input.read_vint()?,
        min_range_size: input.read_hash()?,
    })
}

fn read_flag(input: &mut StreamInput<'_>, what: &str) -> Result<bool> {
    match input.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        flag => Err(SplitError::Decode(format!("invalid {} flag {}", what, flag))),
    }
}

impl Writeable for SplitMetadataStore {
    fn write_to(&self, out: &mut StreamOutput) -> Result<()> {
        let ids = self.split_shard_ids();
        out.write_count(ids.len())?;
        for id in &ids {
            if let Some(partition) = self.try_partition(*id) {
                partition.write_to(out)?;
            }
        }

        let seeds = self.seed_shard_ids();
        out.write_count(seeds.len())?;
        for seed in seeds {
            let leaves = self.leaf_ranges(seed);
            out.write_vint(seed);
            out.write_count(leaves.len())?;
            for range in leaves {
                let partition = self.try_partition(range.shard_id()).ok_or(
                    SplitError::RangeNotFound {
                        seed_shard_id: seed,
                        hash: range.min(),
                    },
                )?;
                partition.write_to(out)?;
            }
        }

        write_settings(&self.settings(), out);
        out.write_vint(self.max_allocated_shard_id());
        Ok(())
    }

    fn read_from(input: &mut StreamInput<'_>) -> Result<Self> {
        let num_partitions = input.read_count()?;
        let mut partitions = AHashMap::with_capacity(num_partitions);
        for _ in 0..num_partitions {
            let partition = PartitionMetadata::read_from(input)?;
            let shard_id = partition.shard_id();
            if partitions.insert(shard_id, partition).is_some() {
                return Err(SplitError::Decode(format!("duplicate shard {}", shard_id)));
            }
        }

        let num_seeds = input.read_count()?;
        let mut seed_ranges = AHashMap::with_capacity(num_seeds);
        for _ in 0..num_seeds {
            let seed = input.read_vint()?;
            let num_leaves = input.read_count()?;
            let mut leaves = LeafSet::new();
            for _ in 0..num_leaves {
                let member = PartitionMetadata::read_from(input)?;
                if partitions.get(&member.shard_id()) != Some(&member) {
                    return Err(SplitError::Decode(format!(
                        "leaf {} of seed {} differs from its flat entry",
                        member.shard_id(),
                        seed
                    )));
                }
                // sorted-set order is rebuilt from range min
                leaves.insert(*member.range());
            }
            if seed_ranges.insert(seed, leaves).is_some() {
                return Err(SplitError::Decode(format!("duplicate seed {}", seed)));
            }
        }

        let settings = read_settings(input)?;
        let max_allocated_shard_id = input.read_vint()?;
        SplitMetadataStore::from_parts(settings, partitions, seed_ranges, max_allocated_shard_id)
    }
}

impl Writeable for SplitMetadataDiff {
    fn write_to(&self, out: &mut StreamOutput) -> Result<()> {
        out.write_count(self.partition_deletes.len())?;
        for &id in &self.partition_deletes {
            out.write_vint(id);
        }
        out.write_count(self.partition_upserts.len())?;
        for partition in &self.partition_upserts {
            partition.write_to(out)?;
        }

        out.write_count(self.seed_deletes.len())?;
        for &seed in &self.seed_deletes {
            out.write_vint(seed);
        }
        out.write_count(self.seed_changes.len())?;
        for change in &self.seed_changes {
            out.write_vint(change.seed_shard_id);
            out.write_count(change.removed.len())?;
            for range in &change.removed {
                range.write_to(out)?;
            }
            out.write_count(change.added.len())?;
            for range in &change.added {
                range.write_to(out)?;
            }
        }

        match &self.settings {
            Some(settings) => {
                out.write_u8(1);
                write_settings(settings, out);
            }
            None => out.write_u8(0),
        }
        match self.max_allocated_shard_id {
            Some(shard_id) => {
                out.write_u8(1);
                out.write_vint(shard_id);
            }
            None => out.write_u8(0),
        }
        Ok(())
    }

    fn read_from(input: &mut StreamInput<'_>) -> Result<Self> {
        let num_deletes = input.read_count()?;
        let mut partition_deletes = Vec::with_capacity(num_deletes);
        for _ in 0..num_deletes {
            partition_deletes.push(input.read_vint()?);
        }
        let num_upserts = input.read_count()?;
        let mut partition_upserts = Vec::with_capacity(num_upserts);
        for _ in 0..num_upserts {
            partition_upserts.push(PartitionMetadata::read_from(input)?);
        }

        let num_seed_deletes = input.read_count()?;
        let mut seed_deletes = Vec::with_capacity(num_seed_deletes);
        for _ in 0..num_seed_deletes {
            seed_deletes.push(input.read_vint()?);
        }
        let num_changes = input.read_count()?;
        let mut seed_changes = Vec::with_capacity(num_changes);
        for _ in 0..num_changes {
            let seed_shard_id = input.read_vint()?;
            let num_removed = input.read_count()?;
            let mut removed = Vec::with_capacity(num_removed);
            for _ in 0..num_removed {
                removed.push(HashRange::read_from(input)?);
            }
            let num_added = input.read_count()?;
            let mut added = Vec::with_capacity(num_added);
            for _ in 0..num_added {
                added.push(HashRange::read_from(input)?);
            }
            seed_changes.push(LeafSetDiff {
                seed_shard_id,
                removed,
                added,
            });
        }

        let settings = if read_flag(input, "settings")? {
            Some(read_settings(input)?)
        } else {
            None
        };
        let max_allocated_shard_id = if read_flag(input, "allocation")? {
            Some(input.read_vint()?)
        } else {
            None
        };

        Ok(SplitMetadataDiff {
            partition_deletes,
            partition_upserts,
            seed_deletes,
            seed_changes,
            settings,
            max_allocated_shard_id,
        })
    }
}
