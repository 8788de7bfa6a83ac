//! Shard Splitting and Consistent Routing
//!
//! Lets a live index split a shard into child shards without moving or
//! rehashing documents that were already placed. Every seed shard owns a
//! partition tree over the hash space `[0, i32::MAX]`; its leaves are the
//! shards currently receiving documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  RoutingResolver                                         │
//! │  - Hashes routing keys, picks the seed shard             │
//! │  - Floor-looks-up the covering leaf in a snapshot        │
//! ├──────────────────────────────────────────────────────────┤
//! │  SplitMetadataService                                    │
//! │  - Single writer, copy-on-write versioned snapshots      │
//! │  - Produces and applies replicated diffs                 │
//! ├──────────────────────────────────────────────────────────┤
//! │  SplitMetadataStore / SplitMetadataDiff                  │
//! │  - Flat shard map + per-seed ordered leaf sets           │
//! │  - Propose / commit / abort, minimal deltas              │
//! ├──────────────────────────────────────────────────────────┤
//! │  PartitionMetadata / HashRange / RoutingMath             │
//! │  - Split tree nodes, range splitting, bucket headroom    │
//! ├──────────────────────────────────────────────────────────┤
//! │  codec / interchange / catalog                           │
//! │  - Varint wire format, JSON documents, checksummed files │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod codec;
pub mod diff;
pub mod hash;
pub mod interchange;
pub mod partition;
pub mod range;
pub mod replication;
pub mod router;
pub mod routing_math;
pub mod store;

#[cfg(test)]
mod tests;

/// Shard identifier, unique per index and never reused
pub type ShardId = u32;

pub use codec::{StreamInput, StreamOutput, Writeable};
pub use diff::{LeafSetDiff, SplitMetadataDiff};
pub use hash::{AHashRouting, HashFunction, Murmur3Hasher, RoutingHasher, RoutingKey};
pub use partition::{PartitionMetadata, SplitState};
pub use range::{HashRange, HASH_SPACE_MAX};
pub use replication::{ApplyOutcome, ReplicatedDiff, SplitMetadataService, VersionedSnapshot};
pub use router::{HashRouting, RoutingResolver};
pub use routing_math::{calculate_routing_shards, IndexRouting, RoutingAllocation};
pub use store::{LeafSet, SplitMetadataStore, SplitSettings};
