//! Hash Range - Contiguous slice of the 32-bit hash space owned by one shard
//!
//! Ranges are inclusive on both ends and live in `[0, i32::MAX]`. Splitting a
//! range produces contiguous, gap-free pieces; the last piece absorbs the
//! remainder of the integer division.

use super::ShardId;
use crate::{Result, SplitError};

/// Largest hash value a range can cover
pub const HASH_SPACE_MAX: i32 = i32::MAX;

/// Inclusive `[min, max]` interval of the hash space plus the owning shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashRange {
    min: i32,
    max: i32,
    shard_id: ShardId,
}

impl HashRange {
    /// Create a range, validating `0 <= min <= max`
    pub fn new(shard_id: ShardId, min: i32, max: i32) -> Result<Self> {
        if min < 0 || min > max {
            return Err(SplitError::InvalidRange { min, max });
        }
        Ok(Self { min, max, shard_id })
    }

    /// The whole hash space `[0, i32::MAX]`
    pub fn full(shard_id: ShardId) -> Self {
        Self {
            min: 0,
            max: HASH_SPACE_MAX,
            shard_id,
        }
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// `min <= hash <= max`
    #[inline]
    pub fn contains(&self, hash: i32) -> bool {
        hash >= self.min && hash <= self.max
    }

    /// Whether the two ranges share at least one hash value
    pub fn overlaps(&self, other: &HashRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Divide into `num_pieces` contiguous ranges
    ///
    /// Piece size is `(max - min) / num_pieces`; the final piece ends at `max`.
    /// New shard ids are `next_shard_id_start + 1, + 2, ...`.
    pub fn split(
        &self,
        num_pieces: u32,
        next_shard_id_start: ShardId,
        min_range_size: i32,
    ) -> Result<Vec<HashRange>> {
        if num_pieces < 2 || num_pieces > i32::MAX as u32 {
            return Err(SplitError::InvalidSplitCount(num_pieces));
        }
        next_shard_id_start
            .checked_add(num_pieces)
            .ok_or(SplitError::InvalidSplitCount(num_pieces))?;

        let range_size = (self.max - self.min) / num_pieces as i32;
        if range_size <= min_range_size {
            return Err(SplitError::RangeTooSmall {
                min: self.min,
                max: self.max,
                num_children: num_pieces,
                min_range_size,
            });
        }

        let mut pieces = Vec::with_capacity(num_pieces as usize);
        let mut start = self.min;
        for i in 0..num_pieces {
            let end = if i == num_pieces - 1 {
                self.max
            } else {
                start + range_size
            };
            pieces.push(HashRange {
                min: start,
                max: end,
                shard_id: next_shard_id_start + i + 1,
            });
            // the last piece ends at max, so this never runs past i32::MAX
            start = end.saturating_add(1);
        }
        Ok(pieces)
    }
}
