//! Partition Metadata - One node of a seed shard's split tree
//!
//! Each node records the shard it describes, the seed shard its whole ancestry
//! descends from, its parent, its hash range and routing allocation, and where
//! it stands in the two-phase split protocol:
//!
//! ```text
//!   Leaf ──propose──▶ Proposed{children} ──commit──▶ Committed{child ids}
//!    ▲                      │
//!    └────────abort─────────┘
//! ```
//!
//! A proposed node still routes as a leaf; its children are ephemeral until
//! the commit promotes them. Committed nodes are never split again directly.

use super::range::HashRange;
use super::routing_math::RoutingAllocation;
use super::ShardId;
use crate::{Result, SplitError};

// ============================================================================
// Split State
// ============================================================================

/// Position of a partition in the propose/commit protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitState {
    /// No split in progress; authoritative for its range
    Leaf,
    /// Children proposed but not yet visible to routing (sorted by range min)
    Proposed { children: Vec<PartitionMetadata> },
    /// Children promoted; retained for history and child lookup
    Committed { child_shard_ids: Vec<ShardId> },
}

// ============================================================================
// Partition Metadata
// ============================================================================

/// Split metadata of a single shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    seed_shard_id: ShardId,
    parent_shard_id: Option<ShardId>,
    range: HashRange,
    routing: RoutingAllocation,
    state: SplitState,
}

impl PartitionMetadata {
    /// Unsplit seed shard owning the whole hash space
    pub fn seed(shard_id: ShardId, index_routing_factor: u32) -> Self {
        Self {
            seed_shard_id: shard_id,
            parent_shard_id: None,
            range: HashRange::full(shard_id),
            routing: RoutingAllocation::seed(index_routing_factor),
            state: SplitState::Leaf,
        }
    }

    /// Rebuild a partition from its parts (decoding paths)
    pub(crate) fn from_parts(
        seed_shard_id: ShardId,
        parent_shard_id: Option<ShardId>,
        range: HashRange,
        routing: RoutingAllocation,
        state: SplitState,
    ) -> Result<Self> {
        let state = match state {
            SplitState::Proposed { mut children } => {
                if children.is_empty() {
                    SplitState::Leaf
                } else {
                    children.sort_by_key(|c| c.range.min());
                    SplitState::Proposed { children }
                }
            }
            SplitState::Committed { child_shard_ids } if child_shard_ids.is_empty() => {
                return Err(SplitError::Decode(format!(
                    "shard {} is committed without children",
                    range.shard_id()
                )));
            }
            other => other,
        };
        Ok(Self {
            seed_shard_id,
            parent_shard_id,
            range,
            routing,
            state,
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.range.shard_id()
    }

    pub fn seed_shard_id(&self) -> ShardId {
        self.seed_shard_id
    }

    /// Parent in the split tree; `None` for seed shards
    pub fn parent_shard_id(&self) -> Option<ShardId> {
        self.parent_shard_id
    }

    pub fn range(&self) -> &HashRange {
        &self.range
    }

    pub fn routing(&self) -> RoutingAllocation {
        self.routing
    }

    pub fn routing_shard(&self) -> u32 {
        self.routing.routing_shard
    }

    pub fn routing_factor(&self) -> u32 {
        self.routing.routing_factor
    }

    pub fn state(&self) -> &SplitState {
        &self.state
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.state, SplitState::Leaf)
    }

    pub fn is_proposed(&self) -> bool {
        matches!(self.state, SplitState::Proposed { .. })
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, SplitState::Committed { .. })
    }

    #[inline]
    pub fn contains(&self, hash: i32) -> bool {
        self.range.contains(hash)
    }

    /// Proposed, uncommitted children (empty outside the Proposed state)
    pub fn ephemeral_children(&self) -> &[PartitionMetadata] {
        match &self.state {
            SplitState::Proposed { children } => children,
            _ => &[],
        }
    }

    /// Children promoted by a commit (empty unless Committed)
    pub fn committed_child_shard_ids(&self) -> &[ShardId] {
        match &self.state {
            SplitState::Committed { child_shard_ids } => child_shard_ids,
            _ => &[],
        }
    }

    /// Largest shard id this node knows of, ephemeral children included
    pub fn max_known_shard_id(&self) -> ShardId {
        let own = self.shard_id();
        match &self.state {
            SplitState::Leaf => own,
            SplitState::Proposed { children } => {
                children.iter().map(|c| c.shard_id()).fold(own, ShardId::max)
            }
            SplitState::Committed { child_shard_ids } => {
                child_shard_ids.iter().copied().fold(own, ShardId::max)
            }
        }
    }

    /// Ephemeral child covering `hash`, if a split is proposed
    ///
    /// Used to place writes buffered for a shard whose split is in flight.
    pub fn find_child_for_hash(&self, hash: i32) -> Option<&PartitionMetadata> {
        let children = self.ephemeral_children();
        let idx = children.partition_point(|c| c.range.min() <= hash);
        idx.checked_sub(1)
            .map(|i| &children[i])
            .filter(|c| c.contains(hash))
    }

    // ========================================================================
    // Split Protocol
    // ========================================================================

    /// Propose a split into `num_children` ephemeral children
    ///
    /// Child routing is sized from this node's own routing factor; child
    /// shard ids start at `next_shard_id_start + 1`.
    pub fn propose_split(
        &mut self,
        num_children: u32,
        next_shard_id_start: ShardId,
        min_range_size: i32,
    ) -> Result<&[PartitionMetadata]> {
        match self.state {
            SplitState::Leaf => {}
            SplitState::Proposed { .. } => {
                return Err(SplitError::SplitAlreadyProposed(self.shard_id()))
            }
            SplitState::Committed { .. } => return Err(SplitError::AlreadySplit(self.shard_id())),
        }

        let routing = RoutingAllocation::for_children(self.routing.routing_factor, num_children)?;
        let ranges = self
            .range
            .split(num_children, next_shard_id_start, min_range_size)?;

        let children = ranges
            .into_iter()
            .map(|range| PartitionMetadata {
                seed_shard_id: self.seed_shard_id,
                parent_shard_id: Some(self.shard_id()),
                range,
                routing,
                state: SplitState::Leaf,
            })
            .collect();
        self.state = SplitState::Proposed { children };
        Ok(self.ephemeral_children())
    }

    /// Drop a pending proposal, returning the discarded children
    ///
    /// Legal only strictly before commit.
    pub fn abort_split(&mut self) -> Result<Vec<PartitionMetadata>> {
        match std::mem::replace(&mut self.state, SplitState::Leaf) {
            SplitState::Proposed { children } => Ok(children),
            SplitState::Leaf => Err(SplitError::NoSplitInProgress(self.shard_id())),
            committed @ SplitState::Committed { .. } => {
                self.state = committed;
                Err(SplitError::AlreadySplit(self.shard_id()))
            }
        }
    }

    /// Move Proposed -> Committed, handing the children to the caller
    ///
    /// Only the owning store calls this, after it has validated the commit.
    pub(crate) fn take_committed_children(&mut self) -> Result<Vec<PartitionMetadata>> {
        match std::mem::replace(&mut self.state, SplitState::Leaf) {
            SplitState::Proposed { children } => {
                self.state = SplitState::Committed {
                    child_shard_ids: children.iter().map(|c| c.shard_id()).collect(),
                };
                Ok(children)
            }
            SplitState::Leaf => Err(SplitError::NoSplitInProgress(self.shard_id())),
            committed @ SplitState::Committed { .. } => {
                self.state = committed;
                Err(SplitError::AlreadySplit(self.shard_id()))
            }
        }
    }
}
