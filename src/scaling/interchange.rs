//! Interchange - Structured-document form of the split metadata
//!
//! Used when split metadata travels as index configuration (JSON) rather
//! than in the binary cluster-state stream. Shard-id map keys are rendered as
//! strings by serde_json.
//!
//! ```json
//! {
//!   "split_shard_metadata_map": { "0": { "shard_id": 0, ... } },
//!   "split_seed_shard_metadata_map": { "0": [ { "shard_id": 1, ... } ] },
//!   "num_seeds": 1,
//!   "routing_factor": 1024,
//!   "min_range_size": 1000,
//!   "max_allocated_shard_id": 2
//! }
//! ```

use std::collections::BTreeMap;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use super::partition::{PartitionMetadata, SplitState};
use super::range::HashRange;
use super::routing_math::RoutingAllocation;
use super::store::{LeafSet, SplitMetadataStore, SplitSettings};
use super::ShardId;
use crate::{Result, SplitError};

/// One partition as a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDoc {
    pub shard_id: ShardId,
    /// Seed shard of the split tree
    pub primary_shard_id: ShardId,
    pub min: i32,
    pub max: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_shard_id: Option<ShardId>,
    pub routing_shard: u32,
    pub routing_factor: u32,
    /// Ephemeral children of a proposed split
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub child_shard_metadata: BTreeMap<ShardId, PartitionDoc>,
    /// Children promoted by a committed split
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_shard_ids: Vec<ShardId>,
}

/// Whole store as a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitMetadataDoc {
    pub split_shard_metadata_map: BTreeMap<ShardId, PartitionDoc>,
    /// Leaf partitions per seed, ordered by range min
    pub split_seed_shard_metadata_map: BTreeMap<ShardId, Vec<PartitionDoc>>,
    pub num_seeds: u32,
    pub routing_factor: u32,
    pub min_range_size: i32,
    /// Highest shard id ever handed out
    pub max_allocated_shard_id: ShardId,
}

impl From<&PartitionMetadata> for PartitionDoc {
    fn from(p: &PartitionMetadata) -> Self {
        Self {
            shard_id: p.shard_id(),
            primary_shard_id: p.seed_shard_id(),
            min: p.range().min(),
            max: p.range().max(),
            parent_shard_id: p.parent_shard_id(),
            routing_shard: p.routing_shard(),
            routing_factor: p.routing_factor(),
            child_shard_metadata: p
                .ephemeral_children()
                .iter()
                .map(|c| (c.shard_id(), PartitionDoc::from(c)))
                .collect(),
            child_shard_ids: p.committed_child_shard_ids().to_vec(),
        }
    }
}

impl PartitionDoc {
    fn into_partition(self, nested: bool) -> Result<PartitionMetadata> {
        let range = HashRange::new(self.shard_id, self.min, self.max)?;
        if nested && (!self.child_shard_metadata.is_empty() || !self.child_shard_ids.is_empty()) {
            return Err(SplitError::Decode(format!(
                "ephemeral child {} carries its own children",
                self.shard_id
            )));
        }
        if !self.child_shard_metadata.is_empty() && !self.child_shard_ids.is_empty() {
            return Err(SplitError::Decode(format!(
                "shard {} is both proposed and committed",
                self.shard_id
            )));
        }

        let state = if !self.child_shard_ids.is_empty() {
            SplitState::Committed {
                child_shard_ids: self.child_shard_ids,
            }
        } else {
            let mut children = Vec::with_capacity(self.child_shard_metadata.len());
            for (key, doc) in self.child_shard_metadata {
                if key != doc.shard_id {
                    return Err(SplitError::Decode(format!(
                        "child entry {} describes shard {}",
                        key, doc.shard_id
                    )));
                }
                children.push(doc.into_partition(true)?);
            }
            SplitState::Proposed { children }
        };

        PartitionMetadata::from_parts(
            self.primary_shard_id,
            self.parent_shard_id,
            range,
            RoutingAllocation {
                routing_shard: self.routing_shard,
                routing_factor: self.routing_factor,
            },
            state,
        )
    }
}

impl TryFrom<PartitionDoc> for PartitionMetadata {
    type Error = SplitError;

    fn try_from(doc: PartitionDoc) -> Result<Self> {
        doc.into_partition(false)
    }
}

impl From<&SplitMetadataStore> for SplitMetadataDoc {
    fn from(store: &SplitMetadataStore) -> Self {
        let split_shard_metadata_map = store
            .partitions()
            .iter()
            .map(|(&id, p)| (id, PartitionDoc::from(p)))
            .collect();

        let split_seed_shard_metadata_map = store
            .seed_ranges()
            .iter()
            .map(|(&seed, leaves)| {
                let docs = leaves
                    .iter()
                    .filter_map(|r| store.try_partition(r.shard_id()))
                    .map(PartitionDoc::from)
                    .collect();
                (seed, docs)
            })
            .collect();

        let settings = store.settings();
        Self {
            split_shard_metadata_map,
            split_seed_shard_metadata_map,
            num_seeds: settings.num_seeds,
            routing_factor: settings.routing_factor,
            min_range_size: settings.min_range_size,
            max_allocated_shard_id: store.max_allocated_shard_id(),
        }
    }
}

impl TryFrom<SplitMetadataDoc> for SplitMetadataStore {
    type Error = SplitError;

    fn try_from(doc: SplitMetadataDoc) -> Result<Self> {
        let mut partitions = AHashMap::with_capacity(doc.split_shard_metadata_map.len());
        for (key, entry) in doc.split_shard_metadata_map {
            if key != entry.shard_id {
                return Err(SplitError::Decode(format!(
                    "entry {} describes shard {}",
                    key, entry.shard_id
                )));
            }
            partitions.insert(key, PartitionMetadata::try_from(entry)?);
        }

        let mut seed_ranges = AHashMap::with_capacity(doc.split_seed_shard_metadata_map.len());
        for (seed, entries) in doc.split_seed_shard_metadata_map {
            let mut leaves = LeafSet::new();
            for entry in entries {
                let member = PartitionMetadata::try_from(entry)?;
                if partitions.get(&member.shard_id()) != Some(&member) {
                    return Err(SplitError::Decode(format!(
                        "leaf {} of seed {} differs from its flat entry",
                        member.shard_id(),
                        seed
                    )));
                }
                leaves.insert(*member.range());
            }
            seed_ranges.insert(seed, leaves);
        }

        SplitMetadataStore::from_parts(
            SplitSettings {
                num_seeds: doc.num_seeds,
                routing_factor: doc.routing_factor,
                min_range_size: doc.min_range_size,
            },
            partitions,
            seed_ranges,
            doc.max_allocated_shard_id,
        )
    }
}

/// Store as a structured document
pub fn to_interchange(store: &SplitMetadataStore) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(SplitMetadataDoc::from(store))?)
}

/// Rebuild a store from a structured document
pub fn from_interchange(value: serde_json::Value) -> Result<SplitMetadataStore> {
    let doc: SplitMetadataDoc = serde_json::from_value(value)?;
    SplitMetadataStore::try_from(doc)
}

/// Store as pretty-printed JSON text
pub fn to_json_string(store: &SplitMetadataStore) -> Result<String> {
    Ok(serde_json::to_string_pretty(&SplitMetadataDoc::from(store))?)
}

pub fn from_json_str(json: &str) -> Result<SplitMetadataStore> {
    let doc: SplitMetadataDoc = serde_json::from_str(json)?;
    SplitMetadataStore::try_from(doc)
}
