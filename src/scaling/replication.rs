//! Replication - Copy-on-write publication of split metadata
//!
//! A single writer per index mutates a private working copy and publishes it
//! as a new immutable, versioned snapshot. Readers load the published `Arc`
//! without taking a lock and keep routing against it for as long as they
//! like; a published snapshot is never modified.
//!
//! Every publication yields a `ReplicatedDiff` that other nodes apply to
//! their own snapshot. Application is idempotent: a diff that does not move
//! the receiver forward is ignored.

use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{info, warn};
use parking_lot::Mutex;

use super::codec::{StreamInput, StreamOutput, Writeable};
use super::diff::SplitMetadataDiff;
use super::router::HashRouting;
use super::store::SplitMetadataStore;
use super::ShardId;
use crate::{Result, SplitError};

// ============================================================================
// Snapshots and Diffs
// ============================================================================

/// Immutable split metadata at one metadata version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedSnapshot {
    version: u64,
    store: SplitMetadataStore,
}

impl VersionedSnapshot {
    pub fn new(version: u64, store: SplitMetadataStore) -> Self {
        Self { version, store }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn store(&self) -> &SplitMetadataStore {
        &self.store
    }

    pub fn into_store(self) -> SplitMetadataStore {
        self.store
    }
}

impl HashRouting for VersionedSnapshot {
    fn leaf_for_hash(&self, seed_shard_id: ShardId, hash: i32) -> Result<ShardId> {
        self.store.leaf_for_hash(seed_shard_id, hash)
    }
}

/// Diff tagged with the versions it connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedDiff {
    pub from_version: u64,
    pub to_version: u64,
    pub diff: SplitMetadataDiff,
}

impl Writeable for ReplicatedDiff {
    fn write_to(&self, out: &mut StreamOutput) -> Result<()> {
        out.write_vlong(self.from_version);
        out.write_vlong(self.to_version);
        self.diff.write_to(out)
    }

    fn read_from(input: &mut StreamInput<'_>) -> Result<Self> {
        let from_version = input.read_vlong()?;
        let to_version = input.read_vlong()?;
        let diff = SplitMetadataDiff::read_from(input)?;
        Ok(Self {
            from_version,
            to_version,
            diff,
        })
    }
}

/// Result of handing a diff or snapshot to a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Published as the new current version
    Applied { version: u64 },
    /// Not newer than the current version; nothing changed
    Stale { current_version: u64 },
}

// ============================================================================
// Split Metadata Service
// ============================================================================

/// Publication point for one index's split metadata
pub struct SplitMetadataService {
    /// Current published snapshot, swapped atomically
    published: ArcSwap<VersionedSnapshot>,
    /// Serializes writers; readers never take it
    writer: Mutex<()>,
}

impl SplitMetadataService {
    /// Publish `store` as version 0
    pub fn new(store: SplitMetadataStore) -> Self {
        Self::from_snapshot(VersionedSnapshot::new(0, store))
    }

    pub fn from_snapshot(snapshot: VersionedSnapshot) -> Self {
        Self {
            published: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot; stays valid and unchanged after later publications
    pub fn snapshot(&self) -> Arc<VersionedSnapshot> {
        self.published.load_full()
    }

    pub fn version(&self) -> u64 {
        self.published.load().version()
    }

    /// Run a batch of mutations and publish the result
    ///
    /// The batch runs against a private copy. If it fails nothing is
    /// published; if it changes nothing the version stays put and the
    /// returned diff is empty.
    pub fn update<T, F>(&self, batch: F) -> Result<(T, ReplicatedDiff)>
    where
        F: FnOnce(&mut SplitMetadataStore) -> Result<T>,
    {
        let _writer = self.writer.lock();
        let current = self.snapshot();
        let mut working = current.store().clone();
        let value = batch(&mut working)?;

        let diff = current.store().diff(&working);
        if diff.is_empty() {
            return Ok((
                value,
                ReplicatedDiff {
                    from_version: current.version(),
                    to_version: current.version(),
                    diff,
                },
            ));
        }

        let next_version = current.version() + 1;
        self.publish(VersionedSnapshot::new(next_version, working));
        info!(
            "Published split metadata version {} (shards touched: {:?})",
            next_version,
            diff.touched_shard_ids()
        );
        Ok((
            value,
            ReplicatedDiff {
                from_version: current.version(),
                to_version: next_version,
                diff,
            },
        ))
    }

    /// Apply a diff published by another node
    ///
    /// Diffs not newer than the current version are ignored. A newer diff
    /// must start from exactly the current version.
    pub fn apply_replicated(&self, replicated: &ReplicatedDiff) -> Result<ApplyOutcome> {
        let _writer = self.writer.lock();
        let current = self.snapshot();

        if replicated.to_version <= current.version() {
            warn!(
                "Ignoring stale split metadata diff {} -> {} (current version {})",
                replicated.from_version,
                replicated.to_version,
                current.version()
            );
            return Ok(ApplyOutcome::Stale {
                current_version: current.version(),
            });
        }
        if replicated.from_version != current.version() {
            return Err(SplitError::VersionMismatch {
                expected: current.version(),
                actual: replicated.from_version,
            });
        }

        let next = replicated.diff.apply(current.store())?;
        self.publish(VersionedSnapshot::new(replicated.to_version, next));
        info!(
            "Applied replicated split metadata version {}",
            replicated.to_version
        );
        Ok(ApplyOutcome::Applied {
            version: replicated.to_version,
        })
    }

    /// Replace the current snapshot with a newer full snapshot
    pub fn install_snapshot(&self, snapshot: VersionedSnapshot) -> Result<ApplyOutcome> {
        let _writer = self.writer.lock();
        let current_version = self.version();
        if snapshot.version() <= current_version {
            warn!(
                "Ignoring split metadata snapshot {} (current version {})",
                snapshot.version(),
                current_version
            );
            return Ok(ApplyOutcome::Stale { current_version });
        }
        let version = snapshot.version();
        self.publish(snapshot);
        info!("Installed split metadata snapshot version {}", version);
        Ok(ApplyOutcome::Applied { version })
    }

    fn publish(&self, snapshot: VersionedSnapshot) {
        self.published.store(Arc::new(snapshot));
    }
}

impl std::fmt::Debug for SplitMetadataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitMetadataService")
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplitConfig;
    use crate::scaling::router::RoutingResolver;

    fn service(num_seeds: u32) -> SplitMetadataService {
        SplitMetadataService::new(
            SplitMetadataStore::with_seeds(num_seeds, &SplitConfig::default()).unwrap(),
        )
    }

    #[test]
    fn test_update_publishes_new_version() {
        let service = service(2);
        let before = service.snapshot();

        let (children, replicated) = service
            .update(|store| {
                store.propose_split(0, 2)?;
                store.commit_split(0)
            })
            .unwrap();
        assert_eq!(children, vec![2, 3]);
        assert_eq!(replicated.from_version, 0);
        assert_eq!(replicated.to_version, 1);
        assert_eq!(service.version(), 1);

        // readers holding the old snapshot are unaffected
        assert_eq!(before.version(), 0);
        assert_eq!(before.store().leaf_shard_ids(0), vec![0]);
        assert_eq!(service.snapshot().store().leaf_shard_ids(0), vec![2, 3]);
    }

    #[test]
    fn test_failed_update_publishes_nothing() {
        let service = service(1);
        let err = service
            .update(|store| {
                store.propose_split(0, 2)?;
                store.commit_split(5)
            })
            .unwrap_err();
        assert!(matches!(err, SplitError::ShardNotFound(5)));
        assert_eq!(service.version(), 0);
        assert!(!service.snapshot().store().has_pending_split(0));
    }

    #[test]
    fn test_noop_update_keeps_version() {
        let service = service(3);
        let (_, replicated) = service.update(|store| Ok(store.len())).unwrap();
        assert!(replicated.diff.is_empty());
        assert_eq!(replicated.to_version, 0);
        assert_eq!(service.version(), 0);
    }

    #[test]
    fn test_replica_follows_leader() {
        let leader = service(2);
        let follower = service(2);

        let (_, d1) = leader.update(|s| s.propose_split(1, 3)).unwrap();
        let (_, d2) = leader.update(|s| s.commit_split(1)).unwrap();

        assert_eq!(follower.apply_replicated(&d1).unwrap(), ApplyOutcome::Applied { version: 1 });
        assert_eq!(follower.apply_replicated(&d2).unwrap(), ApplyOutcome::Applied { version: 2 });
        assert_eq!(*follower.snapshot(), *leader.snapshot());

        // redelivery is harmless
        assert_eq!(
            follower.apply_replicated(&d1).unwrap(),
            ApplyOutcome::Stale { current_version: 2 }
        );
        assert_eq!(*follower.snapshot(), *leader.snapshot());
    }

    #[test]
    fn test_out_of_order_diff_rejected() {
        let leader = service(1);
        let follower = service(1);
        let (_, _d1) = leader.update(|s| s.propose_split(0, 2)).unwrap();
        let (_, d2) = leader.update(|s| s.commit_split(0)).unwrap();

        let err = follower.apply_replicated(&d2).unwrap_err();
        assert!(matches!(err, SplitError::VersionMismatch { expected: 0, actual: 1 }));
        assert_eq!(follower.version(), 0);
    }

    #[test]
    fn test_install_snapshot() {
        let leader = service(1);
        leader.update(|s| s.propose_split(0, 2)).unwrap();
        let follower = service(1);

        let snapshot = (*leader.snapshot()).clone();
        assert_eq!(
            follower.install_snapshot(snapshot.clone()).unwrap(),
            ApplyOutcome::Applied { version: 1 }
        );
        assert_eq!(
            follower.install_snapshot(snapshot).unwrap(),
            ApplyOutcome::Stale { current_version: 1 }
        );
    }

    #[test]
    fn test_replicated_diff_wire_round_trip() {
        let leader = service(2);
        let (_, replicated) = leader
            .update(|s| {
                s.propose_split(0, 2)?;
                s.propose_split(1, 2)?;
                s.commit_split(1)
            })
            .unwrap();
        let bytes = replicated.to_bytes().unwrap();
        assert_eq!(ReplicatedDiff::from_bytes(&bytes).unwrap(), replicated);
    }

    #[test]
    fn test_readers_not_blocked_by_writer() {
        let service = Arc::new(service(1));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        std::thread::scope(|scope| {
            let writer = Arc::clone(&service);
            let handle = scope.spawn(move || {
                writer
                    .update(|s| {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        s.propose_split(0, 2)
                    })
                    .unwrap()
            });

            // the writer is parked inside its batch, holding the writer mutex
            entered_rx.recv().unwrap();
            for _ in 0..100 {
                assert_eq!(service.version(), 0);
                assert_eq!(service.snapshot().store().leaf_shard_ids(0), vec![0]);
            }
            release_tx.send(()).unwrap();
            handle.join().unwrap();
        });
        assert_eq!(service.version(), 1);
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let service = Arc::new(service(1));
        let resolver = RoutingResolver::from_config(&SplitConfig::default());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let service = Arc::clone(&service);
                let resolver = &resolver;
                scope.spawn(move || {
                    for hash in (0..i32::MAX).step_by(7_919_993) {
                        let snapshot = service.snapshot();
                        let store = snapshot.store();
                        for seed in store.seed_shard_ids() {
                            assert!(store.verify_coverage(seed).is_ok());
                        }
                        assert!(resolver.resolve_hash(&*snapshot, 0, hash).is_ok());
                    }
                });
            }

            let mut shard = 0;
            for _ in 0..6 {
                let (children, _) = service
                    .update(|s| {
                        s.propose_split(shard, 2)?;
                        s.commit_split(shard)
                    })
                    .unwrap();
                shard = children[1];
            }
        });
        assert_eq!(service.version(), 6);
    }
}
