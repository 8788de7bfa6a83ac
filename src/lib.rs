//! Shard Split Core - Consistent document routing with live shard splitting
//!
//! Assigns documents to shards through per-seed hash-range partition trees and
//! allows a shard to be split into child shards after the index is live,
//! without moving or rehashing documents that were already placed.
//!
//! The split metadata is diffable and serializable so it can be replicated as
//! part of cluster-wide state without shipping full snapshots on every change.

pub mod config;
pub mod scaling;

// Re-export main types
pub use config::SplitConfig;
pub use scaling::{
    HashRange, PartitionMetadata, RoutingKey, RoutingResolver, ShardId, SplitMetadataDiff,
    SplitMetadataService, SplitMetadataStore, SplitState,
};

/// Split metadata error type
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("Cannot split further: routing factor {routing_factor} has no headroom for {num_children} children")]
    Unsplittable { routing_factor: u32, num_children: u32 },

    #[error("Range [{min}, {max}] too small to split into {num_children} pieces (minimum piece size {min_range_size})")]
    RangeTooSmall {
        min: i32,
        max: i32,
        num_children: u32,
        min_range_size: i32,
    },

    #[error("No leaf range of seed shard {seed_shard_id} covers hash {hash}")]
    RangeNotFound { seed_shard_id: ShardId, hash: i32 },

    #[error("Parent shard {0} not found in split metadata")]
    ParentNotFound(ShardId),

    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("Invalid split count: {0}")]
    InvalidSplitCount(u32),

    #[error("Invalid hash range: [{min}, {max}]")]
    InvalidRange { min: i32, max: i32 },

    #[error("Split already proposed for shard {0}")]
    SplitAlreadyProposed(ShardId),

    #[error("Shard {0} has already been split")]
    AlreadySplit(ShardId),

    #[error("No split in progress for shard {0}")]
    NoSplitInProgress(ShardId),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Interchange error: {0}")]
    Interchange(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SplitError {
    /// Invariant violations: the affected operation must halt, never guess a shard
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SplitError::RangeNotFound { .. } | SplitError::ParentNotFound(_)
        )
    }

    /// Validation errors that reject a split request and leave the index untouched
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            SplitError::Unsplittable { .. }
                | SplitError::RangeTooSmall { .. }
                | SplitError::InvalidSplitCount(_)
                | SplitError::SplitAlreadyProposed(_)
                | SplitError::AlreadySplit(_)
                | SplitError::NoSplitInProgress(_)
                | SplitError::ShardNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SplitError>;
