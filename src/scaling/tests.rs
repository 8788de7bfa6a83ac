//! Cross-component scenarios: split sequences, replication round trips and
//! the binary-branching routing table checked against the same resolver.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::codec::Writeable;
use super::interchange;
use super::router::{HashRouting, RoutingResolver};
use super::routing_math::RoutingAllocation;
use super::*;
use crate::config::SplitConfig;
use crate::{Result, SplitError};

fn store(num_seeds: u32) -> SplitMetadataStore {
    SplitMetadataStore::with_seeds(num_seeds, &SplitConfig::default()).unwrap()
}

fn resolver() -> RoutingResolver {
    RoutingResolver::from_config(&SplitConfig::default())
}

/// Leaves of every seed partition the hash space and hang off committed parents
fn assert_consistent(store: &SplitMetadataStore) {
    for seed in store.seed_shard_ids() {
        store.verify_coverage(seed).unwrap();
        let ranges = store.leaf_ranges(seed);
        assert_eq!(ranges.first().unwrap().min(), 0);
        assert_eq!(ranges.last().unwrap().max(), i32::MAX);
        for pair in ranges.windows(2) {
            assert!(!pair[0].overlaps(&pair[1]));
            assert_eq!(pair[0].max() as i64 + 1, pair[1].min() as i64);
        }

        for range in &ranges {
            let leaf = store.try_partition(range.shard_id()).unwrap();
            assert_eq!(leaf.seed_shard_id(), seed);
            assert!(!leaf.is_committed());

            // walk the back-references up to the seed
            let mut node = leaf;
            while let Some(parent_id) = node.parent_shard_id() {
                let parent = store.try_partition(parent_id).unwrap();
                assert!(parent.committed_child_shard_ids().contains(&node.shard_id()));
                assert!(parent.range().min() <= node.range().min());
                assert!(parent.range().max() >= node.range().max());
                node = parent;
            }
            assert_eq!(node.shard_id(), seed);
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_single_shard_split_in_two() {
    let mut store = store(1);
    assert_eq!(store.get_partition(0).routing_shard(), 1024);

    store.propose_split(0, 2).unwrap();
    store.commit_split(0).unwrap();

    let ranges = store.leaf_ranges(0);
    assert_eq!(ranges, vec![
        HashRange::new(1, 0, 1_073_741_823).unwrap(),
        HashRange::new(2, 1_073_741_824, i32::MAX).unwrap(),
    ]);
    assert_eq!(store.find_leaf_for_hash(0, 0).unwrap().shard_id(), 1);
    assert_eq!(store.find_leaf_for_hash(0, i32::MAX).unwrap().shard_id(), 2);
    assert_eq!(store.get_partition(1).parent_shard_id(), Some(0));
}

#[test]
fn test_scenario_propose_then_commit_three_way() {
    let mut store = store(5);
    let parent_range = *store.get_partition(2).range();

    let children = store.propose_split(2, 3).unwrap();
    assert_eq!(children, vec![5, 6, 7]);
    assert!(!store.is_parent_shard(2));
    assert!(store.leaf_ranges(2).contains(&parent_range));

    store.commit_split(2).unwrap();
    assert!(store.is_parent_shard(2));

    let leaves = store.leaf_ranges(2);
    assert!(!leaves.contains(&parent_range));
    assert_eq!(leaves.len(), 3);
    assert_eq!(
        leaves.iter().map(|r| r.shard_id()).collect::<Vec<_>>(),
        vec![5, 6, 7]
    );
    assert_eq!(store.get_child_shard_ids(2), vec![5, 6, 7]);
    assert_consistent(&store);
}

#[test]
fn test_scenario_empty_diff() {
    let store = store(5);
    let diff = store.diff(&store);
    assert!(diff.is_empty());
    assert!(diff.touched_shard_ids().is_empty());
    assert_eq!(diff.apply(&store).unwrap(), store);
    assert_eq!(SplitMetadataDiff::default().apply(&store).unwrap(), store);
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_routing_headroom_runs_out_deterministically() {
    let mut store = store(1);
    let mut shard = 0;
    let mut splits = 0;
    let err = loop {
        let factor = store.get_partition(shard).routing_factor();
        match store.propose_split(shard, 2) {
            Ok(children) => {
                store.commit_split(shard).unwrap();
                let child = store.get_partition(children[0]);
                assert!(child.routing_factor() >= 1);
                assert!(child.routing_factor() < factor);
                assert_eq!(child.routing_shard() % child.routing_factor(), 0);
                assert!((child.routing_shard() / child.routing_factor()).is_power_of_two());
                shard = children[1];
                splits += 1;
            }
            Err(e) => break e,
        }
    };
    // 1024 -> 512 -> ... -> 2
    assert_eq!(splits, 9);
    assert!(matches!(err, SplitError::Unsplittable { routing_factor: 2, num_children: 2 }));
    assert!(err.is_user_facing());
    assert!(!store.has_pending_split(shard));
    assert_consistent(&store);
}

#[test]
fn test_range_granularity_limits_splits() {
    let config = SplitConfig {
        max_routing_shards_log2: 30,
        min_range_size: i32::MAX / 8,
        ..SplitConfig::default()
    };
    let mut store = SplitMetadataStore::with_seeds(1, &config).unwrap();
    store.propose_split(0, 4).unwrap();
    store.commit_split(0).unwrap();
    let err = store.propose_split(1, 2).unwrap_err();
    assert!(matches!(err, SplitError::RangeTooSmall { num_children: 2, .. }));
    assert!(store.try_partition(1).unwrap().is_leaf());
}

#[test]
fn test_randomized_split_sequences() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let resolver = resolver();
    let mut store = store(3);
    let mut history = vec![store.clone()];
    let mut handed_out: BTreeSet<ShardId> = store.split_shard_ids().into_iter().collect();

    for _ in 0..150 {
        let candidates: Vec<ShardId> = store
            .seed_shard_ids()
            .into_iter()
            .flat_map(|seed| store.leaf_shard_ids(seed))
            .filter(|&id| !store.has_pending_split(id))
            .collect();
        let Some(&shard) = candidates.choose(&mut rng) else {
            break;
        };
        let seed = store.get_partition(shard).seed_shard_id();
        let num_children = rng.gen_range(2..=4);

        let children = match store.propose_split(shard, num_children) {
            Ok(children) => children,
            Err(e) => {
                assert!(e.is_user_facing(), "unexpected error {:?}", e);
                continue;
            }
        };
        assert_consistent(&store);
        // aborted children never come back under a new proposal
        for id in &children {
            assert!(handed_out.insert(*id), "shard id {} handed out twice", id);
        }

        let samples: Vec<(i32, ShardId)> = (0..32)
            .map(|_| {
                let hash = rng.gen_range(0..=i32::MAX);
                (hash, resolver.resolve_hash(&store, seed, hash).unwrap())
            })
            .collect();

        if rng.gen_bool(0.2) {
            store.abort_split(shard).unwrap();
        } else {
            store.commit_split(shard).unwrap();
        }
        assert_consistent(&store);

        for (hash, before) in samples {
            let after = resolver.resolve_hash(&store, seed, hash).unwrap();
            if before == shard && store.is_parent_shard(shard) {
                assert!(children.contains(&after));
            } else {
                assert_eq!(after, before);
            }
        }
        history.push(store.clone());
    }
    assert!(history.len() > 50);

    // leave some proposals pending in the final snapshot
    for seed in store.seed_shard_ids() {
        let leaf = store.leaf_shard_ids(seed)[0];
        let _ = store.propose_split(leaf, 2);
    }
    history.push(store.clone());

    for _ in 0..40 {
        let a = history.choose(&mut rng).unwrap();
        let b = history.choose(&mut rng).unwrap();
        assert_eq!(&a.diff(b).apply(a).unwrap(), b);

        let wire = a.diff(b).to_bytes().unwrap();
        assert_eq!(SplitMetadataDiff::from_bytes(&wire).unwrap().apply(a).unwrap(), *b);
    }
    for snapshot in &history {
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(&SplitMetadataStore::from_bytes(&bytes).unwrap(), snapshot);
        let json = interchange::to_json_string(snapshot).unwrap();
        assert_eq!(&interchange::from_json_str(&json).unwrap(), snapshot);
    }
}

#[test]
fn test_pipelined_batch_through_service() {
    let service = SplitMetadataService::new(store(4));
    let follower = SplitMetadataService::new(store(4));

    let (_, d1) = service
        .update(|s| {
            s.propose_split(0, 2)?;
            s.propose_split(3, 2)?;
            s.commit_split(3)
        })
        .unwrap();
    let (_, d2) = service
        .update(|s| {
            s.commit_split(0)?;
            s.propose_split(6, 3)
        })
        .unwrap();

    for d in [&d1, &d2] {
        let decoded = ReplicatedDiff::from_bytes(&d.to_bytes().unwrap()).unwrap();
        follower.apply_replicated(&decoded).unwrap();
    }
    let snapshot = follower.snapshot();
    assert_eq!(*snapshot, *service.snapshot());
    assert_eq!(snapshot.store().leaf_shard_ids(0), vec![4, 5]);
    assert_eq!(snapshot.store().leaf_shard_ids(3), vec![6, 7]);
    assert!(snapshot.store().has_pending_split(6));
    assert_eq!(snapshot.store().max_allocated_shard_id(), 10);
    assert_consistent(snapshot.store());
}

// ============================================================================
// Binary-branching routing table
// ============================================================================

/// Fixed two-way split table addressed by routing buckets
///
/// Every split node reserves buckets for its two children; a hash walks
/// down the table by `floor_mod(hash, routing_shard) / routing_factor` of the
/// child allocation until it reaches a node without children.
struct BinarySplitTable {
    nodes: Vec<BinaryNode>,
}

struct BinaryNode {
    parent: Option<ShardId>,
    routing: RoutingAllocation,
    children: Option<[ShardId; 2]>,
}

impl BinarySplitTable {
    fn new(num_seeds: u32, index_routing_factor: u32) -> Self {
        let nodes = (0..num_seeds)
            .map(|_| BinaryNode {
                parent: None,
                routing: RoutingAllocation::seed(index_routing_factor),
                children: None,
            })
            .collect();
        Self { nodes }
    }

    fn node(&self, shard_id: ShardId) -> Result<&BinaryNode> {
        self.nodes
            .get(shard_id as usize)
            .ok_or(SplitError::ShardNotFound(shard_id))
    }

    fn split(&mut self, shard_id: ShardId) -> Result<[ShardId; 2]> {
        let node = self.node(shard_id)?;
        if node.children.is_some() {
            return Err(SplitError::AlreadySplit(shard_id));
        }
        let routing = RoutingAllocation::for_children(node.routing.routing_factor, 2)?;
        let first = self.nodes.len() as ShardId;
        for _ in 0..2 {
            self.nodes.push(BinaryNode {
                parent: Some(shard_id),
                routing,
                children: None,
            });
        }
        let children = [first, first + 1];
        self.nodes[shard_id as usize].children = Some(children);
        Ok(children)
    }

    fn seed_of(&self, mut shard_id: ShardId) -> Result<ShardId> {
        while let Some(parent) = self.node(shard_id)?.parent {
            shard_id = parent;
        }
        Ok(shard_id)
    }

    fn leaves(&self) -> Vec<ShardId> {
        (0..self.nodes.len() as ShardId)
            .filter(|&id| self.nodes[id as usize].children.is_none())
            .collect()
    }
}

impl HashRouting for BinarySplitTable {
    fn leaf_for_hash(&self, seed_shard_id: ShardId, hash: i32) -> Result<ShardId> {
        let mut shard_id = seed_shard_id;
        while let Some(children) = self.node(shard_id)?.children {
            let allocation = self.node(children[0])?.routing;
            shard_id = children[allocation.bucket_for(hash) as usize];
        }
        Ok(shard_id)
    }
}

#[test]
fn test_binary_table_honours_resolver_contract() {
    let mut rng = StdRng::seed_from_u64(7);
    let resolver = resolver();
    let mut table = BinarySplitTable::new(2, 512);

    for _ in 0..12 {
        let leaves = table.leaves();
        let &shard = leaves.choose(&mut rng).unwrap();
        let seed = table.seed_of(shard).unwrap();

        let samples: Vec<(i32, ShardId)> = (0..64)
            .map(|_| {
                let hash = rng.gen::<i32>();
                (hash, resolver.resolve_hash(&table, seed, hash).unwrap())
            })
            .collect();

        let children = match table.split(shard) {
            Ok(children) => children,
            Err(e) => {
                assert!(matches!(e, SplitError::Unsplittable { .. }));
                continue;
            }
        };
        for (hash, before) in samples {
            let after = resolver.resolve_hash(&table, seed, hash).unwrap();
            if before == shard {
                assert!(children.contains(&after));
            } else {
                assert_eq!(after, before);
            }
        }
    }

    // every leaf is reachable and only leaves are returned
    let leaves = table.leaves();
    for &leaf in &leaves {
        let seed = table.seed_of(leaf).unwrap();
        let reached = (0..4096).any(|h| table.leaf_for_hash(seed, h).unwrap() == leaf);
        assert!(reached, "leaf {} unreachable", leaf);
    }
}

#[test]
fn test_binary_table_and_store_share_headroom() {
    let config = SplitConfig::default();
    let routing = config.index_routing(1).unwrap();
    let mut table = BinarySplitTable::new(1, routing.routing_factor());
    let mut store = SplitMetadataStore::with_seeds(1, &config).unwrap();

    let mut table_shard = 0;
    let mut store_shard = 0;
    loop {
        let table_result = table.split(table_shard);
        let store_result = store.propose_split(store_shard, 2);
        assert_eq!(table_result.is_ok(), store_result.is_ok());
        match (table_result, store_result) {
            (Ok(t), Ok(s)) => {
                store.commit_split(store_shard).unwrap();
                assert_eq!(
                    table.node(t[0]).unwrap().routing,
                    store.get_partition(s[0]).routing()
                );
                table_shard = t[0];
                store_shard = s[0];
            }
            _ => break,
        }
    }
    assert_eq!(table.leaves().len(), store.leaf_shard_ids(0).len());
}
