//! Policy-driven victim selection under memory pressure.
//!
//! The planner answers one question: which cached blocks give way so that a
//! requested number of bytes becomes free. Victims must share the memory
//! mode of the request, must not belong to the requesting block's own
//! dataset (an oversized dataset must not thrash itself), and must be
//! write-lockable without blocking. Selection only commits once the byte
//! target is reachable; otherwise every tentatively locked candidate is
//! released and nothing is evicted.
//!
//! Dropping a victim goes through the injected [`BlockEvictionHandler`],
//! which may spill the block to disk. A spilled block keeps its tier-wide
//! reference count and lock metadata; a discarded block loses all per-block
//! state.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use blockgrid_core::{BlockId, MemoryMode, StorageLevel, Value};

use super::account::MemoryAccount;
use super::entry::{ChunkedByteBuffer, Entry};
use super::entry_table::{EntrySnapshot, EntryTable};
use super::lock_table::BlockLockTable;
use super::reference::ReferenceModel;

/// Which ordering the planner uses to pick victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least-recently-used first.
    Lru,
    /// Lowest remaining in-memory reference count first.
    Lrc,
    /// Expired or shortest remaining lease first.
    Leasing,
}

/// Contents of a block handed to the eviction handler.
pub enum EvictedData {
    Values(Arc<Vec<Value>>),
    Bytes(ChunkedByteBuffer),
}

/// Capability to move a block out of memory, injected at store construction.
///
/// The handler may re-enter the store (for example to report the block's new
/// status); the planner therefore never holds the account's byte-count mutex
/// while calling it.
pub trait BlockEvictionHandler: Send + Sync {
    /// Drops the block from memory, spilling if the caller's storage level
    /// asks for it, and returns the block's resulting storage level.
    fn drop_from_memory(&self, block: &BlockId, data: EvictedData) -> StorageLevel;
}

/// Discards every evicted block outright; the default when no spill path is
/// wired.
pub struct DiscardingEvictionHandler;

impl BlockEvictionHandler for DiscardingEvictionHandler {
    fn drop_from_memory(&self, _block: &BlockId, _data: EvictedData) -> StorageLevel {
        StorageLevel::NONE
    }
}

/// Selects and drops victims for one worker's memory store.
pub struct EvictionPlanner {
    policy: EvictionPolicy,
    entries: Arc<EntryTable>,
    locks: Arc<BlockLockTable>,
    refs: Arc<ReferenceModel>,
    account: Arc<MemoryAccount>,
    handler: Arc<dyn BlockEvictionHandler>,
}

impl EvictionPlanner {
    #[must_use]
    pub fn new(
        policy: EvictionPolicy,
        entries: Arc<EntryTable>,
        locks: Arc<BlockLockTable>,
        refs: Arc<ReferenceModel>,
        account: Arc<MemoryAccount>,
        handler: Arc<dyn BlockEvictionHandler>,
    ) -> Self {
        Self {
            policy,
            entries,
            locks,
            refs,
            account,
            handler,
        }
    }

    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Tries to free at least `needed` bytes in `mode` on behalf of
    /// `requesting`. Returns the bytes actually freed, or 0 if the target
    /// was unreachable (in which case nothing was evicted).
    pub fn try_free(
        &self,
        requesting: Option<&BlockId>,
        needed: u64,
        mode: MemoryMode,
    ) -> u64 {
        if needed == 0 {
            return 0;
        }

        let requesting_dataset = requesting.and_then(BlockId::dataset_id);
        let base: Vec<EntrySnapshot> = self
            .entries
            .snapshot_lru_first()
            .into_iter()
            .filter(|c| c.mode == mode)
            .filter(|c| {
                requesting_dataset.is_none() || c.block.dataset_id() != requesting_dataset
            })
            .collect();

        let candidates = match self.policy {
            EvictionPolicy::Lru => base,
            EvictionPolicy::Lrc => self.order_by_reference_count(base, requesting),
            EvictionPolicy::Leasing => self.order_by_lease(base, requesting),
        };

        let mut selected: Vec<BlockId> = Vec::new();
        let mut reachable = 0_u64;
        for candidate in candidates {
            if reachable >= needed {
                break;
            }
            if !self.locks.lock_for_writing(&candidate.block, false) {
                continue;
            }
            // Re-read under the lock: the snapshot may be stale.
            let Some(size) = self.entries.peek_size(&candidate.block) else {
                self.locks.unlock_write(&candidate.block);
                continue;
            };
            reachable += size;
            selected.push(candidate.block);
        }

        if reachable < needed {
            for block in &selected {
                self.locks.unlock_write(block);
            }
            warn!(needed, reachable, policy = ?self.policy, "eviction target unreachable");
            return 0;
        }

        let mut freed = 0_u64;
        for block in &selected {
            freed += self.drop_locked_block(block);
        }
        debug!(needed, freed, victims = selected.len(), policy = ?self.policy, "evicted blocks");
        freed
    }

    /// Drops every dataset block whose dataset's lease has run out. Unlike
    /// [`try_free`](Self::try_free) there is no byte target; everything
    /// expired and write-lockable goes.
    pub fn check_lease(&self) {
        let expired = self.refs.expired_lease_datasets();
        if expired.is_empty() {
            return;
        }

        let mut dropped = 0_usize;
        for candidate in self.entries.snapshot_lru_first() {
            let Some(dataset) = candidate.block.dataset_id() else {
                continue;
            };
            if !expired.contains(&dataset) {
                continue;
            }
            if !self.locks.lock_for_writing(&candidate.block, false) {
                continue;
            }
            self.drop_locked_block(&candidate.block);
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "lease check dropped expired blocks");
        }
    }

    /// LRC order: in-memory reference count ascending, truncated where a
    /// candidate is no less referenced than the incoming block.
    fn order_by_reference_count(
        &self,
        base: Vec<EntrySnapshot>,
        requesting: Option<&BlockId>,
    ) -> Vec<EntrySnapshot> {
        let incoming = requesting.map_or(i64::MAX, |b| self.refs.incoming_ref_for(b));

        let mut ranked: Vec<(i64, EntrySnapshot)> = base
            .into_iter()
            .map(|c| (self.refs.current_ref(&c.block).unwrap_or(0), c))
            .collect();
        ranked.sort_by_key(|(count, _)| *count);
        ranked
            .into_iter()
            .take_while(|(count, _)| *count < incoming)
            .map(|(_, c)| c)
            .collect()
    }

    /// Leasing order: first dataset blocks with no lease protection at all,
    /// then datasets by remaining lease ascending while the incoming
    /// dataset's lease does not exceed theirs.
    fn order_by_lease(
        &self,
        base: Vec<EntrySnapshot>,
        requesting: Option<&BlockId>,
    ) -> Vec<EntrySnapshot> {
        let incoming_lease = requesting
            .and_then(BlockId::dataset_id)
            .map_or(0, |d| self.refs.lease_for_admission(d));

        let mut unleased: Vec<EntrySnapshot> = Vec::new();
        let mut leased: Vec<(i64, EntrySnapshot)> = Vec::new();
        for candidate in base {
            let Some(dataset) = candidate.block.dataset_id() else {
                continue;
            };
            match self.refs.current_lease_of(dataset) {
                None => unleased.push(candidate),
                Some(lease) if incoming_lease <= lease => leased.push((lease, candidate)),
                Some(_) => {}
            }
        }
        leased.sort_by_key(|(lease, _)| *lease);

        unleased
            .into_iter()
            .chain(leased.into_iter().map(|(_, c)| c))
            .collect()
    }

    /// Drops one block the caller has write-locked. Returns the bytes freed.
    fn drop_locked_block(&self, block: &BlockId) -> u64 {
        let Some(entry) = self.entries.remove(block) else {
            self.locks.unlock_write(block);
            return 0;
        };
        let size = entry.size();
        let mode = entry.mode();
        let data = match entry {
            Entry::Deserialized { values, .. } => EvictedData::Values(values),
            Entry::Serialized { buffer, .. } => EvictedData::Bytes(buffer),
        };

        let new_level = self.handler.drop_from_memory(block, data);
        self.account.release_storage(size, mode);
        self.refs.on_evicted(block, new_level.is_valid());
        if new_level.is_valid() {
            self.locks.unlock_write(block);
        } else {
            self.locks.remove_block(block);
        }

        counter!("blockgrid_evicted_blocks").increment(1);
        counter!("blockgrid_evicted_bytes").increment(size);
        debug!(block = %block, size, spilled = new_level.is_valid(), "dropped block from memory");
        size
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use blockgrid_core::{DagInfo, ProfileBundle, ReuseHistogram};

    use super::*;

    struct Fixture {
        entries: Arc<EntryTable>,
        locks: Arc<BlockLockTable>,
        refs: Arc<ReferenceModel>,
        account: Arc<MemoryAccount>,
    }

    /// Records dropped blocks and reports a fixed post-drop level.
    struct RecordingHandler {
        dropped: Mutex<Vec<BlockId>>,
        result_level: StorageLevel,
    }

    impl RecordingHandler {
        fn new(result_level: StorageLevel) -> Arc<Self> {
            Arc::new(Self {
                dropped: Mutex::new(Vec::new()),
                result_level,
            })
        }

        fn dropped(&self) -> Vec<BlockId> {
            self.dropped.lock().unwrap().clone()
        }
    }

    impl BlockEvictionHandler for RecordingHandler {
        fn drop_from_memory(&self, block: &BlockId, _data: EvictedData) -> StorageLevel {
            self.dropped.lock().unwrap().push(block.clone());
            self.result_level
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            entries: Arc::new(EntryTable::new()),
            locks: Arc::new(BlockLockTable::new()),
            refs: Arc::new(ReferenceModel::new()),
            account: Arc::new(MemoryAccount::new(1000, 1000)),
        }
    }

    fn planner(
        f: &Fixture,
        policy: EvictionPolicy,
        handler: Arc<dyn BlockEvictionHandler>,
    ) -> EvictionPlanner {
        EvictionPlanner::new(
            policy,
            Arc::clone(&f.entries),
            Arc::clone(&f.locks),
            Arc::clone(&f.refs),
            Arc::clone(&f.account),
            handler,
        )
    }

    fn cache_block(f: &Fixture, block: &BlockId, size: u64) {
        assert!(f.account.acquire_storage(Some(block), size, MemoryMode::OnHeap, |_| 0));
        f.entries.put(
            block.clone(),
            Entry::Serialized {
                buffer: ChunkedByteBuffer::from_vec(vec![0; usize::try_from(size).unwrap()]),
                mode: MemoryMode::OnHeap,
            },
        );
        f.refs.register_block(block);
    }

    #[test]
    fn lru_evicts_least_recent_first() {
        let f = fixture();
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lru, handler.clone());

        for i in 0..3 {
            cache_block(&f, &BlockId::dataset(i, 0), 40);
        }
        // Touch dataset 0 so dataset 1 becomes the oldest.
        f.entries.get(&BlockId::dataset(0, 0));

        let freed = p.try_free(Some(&BlockId::dataset(9, 0)), 40, MemoryMode::OnHeap);
        assert_eq!(freed, 40);
        assert_eq!(handler.dropped(), vec![BlockId::dataset(1, 0)]);
        assert!(!f.entries.contains(&BlockId::dataset(1, 0)));
    }

    #[test]
    fn never_evicts_the_requesting_dataset() {
        let f = fixture();
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lru, handler.clone());

        cache_block(&f, &BlockId::dataset(1, 0), 40);
        cache_block(&f, &BlockId::dataset(1, 1), 40);

        let freed = p.try_free(Some(&BlockId::dataset(1, 2)), 40, MemoryMode::OnHeap);
        assert_eq!(freed, 0);
        assert!(handler.dropped().is_empty());
    }

    #[test]
    fn shortfall_releases_all_locks_and_evicts_nothing() {
        let f = fixture();
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lru, handler.clone());

        cache_block(&f, &BlockId::dataset(1, 0), 40);
        let freed = p.try_free(Some(&BlockId::dataset(2, 0)), 100, MemoryMode::OnHeap);
        assert_eq!(freed, 0);
        assert!(handler.dropped().is_empty());
        // The tentative write lock was released.
        assert_eq!(f.locks.holders(&BlockId::dataset(1, 0)), (0, false));
    }

    #[test]
    fn locked_blocks_are_skipped() {
        let f = fixture();
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lru, handler.clone());

        cache_block(&f, &BlockId::dataset(1, 0), 40);
        cache_block(&f, &BlockId::dataset(2, 0), 40);
        assert!(f.locks.lock_for_reading(&BlockId::dataset(1, 0), false));

        let freed = p.try_free(Some(&BlockId::dataset(9, 0)), 40, MemoryMode::OnHeap);
        assert_eq!(freed, 40);
        assert_eq!(handler.dropped(), vec![BlockId::dataset(2, 0)]);
    }

    #[test]
    fn mode_mismatch_excludes_candidates() {
        let f = fixture();
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lru, handler.clone());

        cache_block(&f, &BlockId::dataset(1, 0), 40);
        let freed = p.try_free(Some(&BlockId::dataset(9, 0)), 40, MemoryMode::OffHeap);
        assert_eq!(freed, 0);
    }

    #[test]
    fn lrc_prefers_lowest_reference_count() {
        let f = fixture();
        f.refs.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 1), (2, 5), (3, 3)]),
            ..ProfileBundle::default()
        });
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lrc, handler.clone());

        cache_block(&f, &BlockId::dataset(2, 0), 60);
        cache_block(&f, &BlockId::dataset(1, 0), 50);

        // Dataset 3 (count 3) admits: dataset 1 (count 1) goes first.
        let freed = p.try_free(Some(&BlockId::dataset(3, 0)), 10, MemoryMode::OnHeap);
        assert_eq!(freed, 50);
        assert_eq!(handler.dropped(), vec![BlockId::dataset(1, 0)]);
    }

    #[test]
    fn lrc_never_evicts_higher_counts_than_incoming() {
        let f = fixture();
        f.refs.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 4), (2, 2)]),
            ..ProfileBundle::default()
        });
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lrc, handler.clone());

        cache_block(&f, &BlockId::dataset(1, 0), 40);

        // Incoming count 2 < cached count 4: nothing may be evicted.
        let freed = p.try_free(Some(&BlockId::dataset(2, 0)), 10, MemoryMode::OnHeap);
        assert_eq!(freed, 0);
        assert!(handler.dropped().is_empty());
    }

    #[test]
    fn lrc_broadcast_always_admits() {
        let f = fixture();
        f.refs.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 100)]),
            ..ProfileBundle::default()
        });
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lrc, handler.clone());

        cache_block(&f, &BlockId::dataset(1, 0), 40);
        let incoming = BlockId::Broadcast { broadcast_id: 7 };
        let freed = p.try_free(Some(&incoming), 10, MemoryMode::OnHeap);
        assert_eq!(freed, 40);
    }

    fn leasing_fixture() -> (Fixture, Arc<RecordingHandler>, EvictionPlanner) {
        let f = fixture();
        let mut dag = DagInfo::new();
        dag.insert(1, ReuseHistogram::from([(2, 1)]));
        dag.insert(2, ReuseHistogram::from([(4, 1)]));
        f.refs.replace_dag_info(dag);
        f.refs.set_lease_map(HashMap::from([(1, 2), (2, 4)]));
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Leasing, handler.clone());
        (f, handler, p)
    }

    #[test]
    fn leasing_phase_one_takes_unleased_datasets_first() {
        let (f, handler, p) = leasing_fixture();
        // Dataset 9 has no histogram, so it carries no lease at all.
        cache_block(&f, &BlockId::dataset(9, 0), 40);
        cache_block(&f, &BlockId::dataset(1, 0), 40);

        let freed = p.try_free(Some(&BlockId::dataset(2, 0)), 10, MemoryMode::OnHeap);
        assert_eq!(freed, 40);
        assert_eq!(handler.dropped(), vec![BlockId::dataset(9, 0)]);
    }

    #[test]
    fn leasing_phase_two_orders_by_remaining_lease() {
        let (f, handler, p) = leasing_fixture();
        cache_block(&f, &BlockId::dataset(1, 0), 40);
        cache_block(&f, &BlockId::dataset(2, 0), 40);

        // Incoming dataset 1 (lease 2): dataset 1's own blocks are excluded,
        // dataset 2 (lease 4 >= 2) is fair game.
        let freed = p.try_free(Some(&BlockId::dataset(1, 1)), 10, MemoryMode::OnHeap);
        assert_eq!(freed, 40);
        assert_eq!(handler.dropped(), vec![BlockId::dataset(2, 0)]);
    }

    #[test]
    fn leasing_protects_longer_leased_incoming() {
        let (f, handler, p) = leasing_fixture();
        cache_block(&f, &BlockId::dataset(1, 0), 40);

        // Incoming dataset 2 has lease 4 > cached dataset 1's lease 2:
        // the cached block is protected.
        let freed = p.try_free(Some(&BlockId::dataset(2, 0)), 10, MemoryMode::OnHeap);
        assert_eq!(freed, 0);
        assert!(handler.dropped().is_empty());
    }

    #[test]
    fn check_lease_drops_expired_datasets() {
        let (f, handler, p) = leasing_fixture();
        cache_block(&f, &BlockId::dataset(1, 0), 40);
        cache_block(&f, &BlockId::dataset(2, 0), 40);

        // Two accesses of dataset 2 age dataset 1's lease (2) down to zero.
        f.refs.tick_access(2);
        f.refs.tick_access(2);
        p.check_lease();

        assert_eq!(handler.dropped(), vec![BlockId::dataset(1, 0)]);
        assert!(f.entries.contains(&BlockId::dataset(2, 0)));
    }

    #[test]
    fn spilled_blocks_keep_ref_map_and_lock_metadata() {
        let f = fixture();
        f.refs.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 5)]),
            ..ProfileBundle::default()
        });
        let handler = RecordingHandler::new(StorageLevel::DISK_ONLY);
        let p = planner(&f, EvictionPolicy::Lru, handler.clone());

        let block = BlockId::dataset(1, 0);
        cache_block(&f, &block, 40);
        let freed = p.try_free(Some(&BlockId::dataset(2, 0)), 10, MemoryMode::OnHeap);
        assert_eq!(freed, 40);

        assert_eq!(f.refs.ref_of(&block), Some(5));
        assert!(f.refs.current_ref(&block).is_none());
        assert_eq!(f.account.storage_used(MemoryMode::OnHeap), 0);
        // The write lock was released rather than the metadata removed.
        assert_eq!(f.locks.holders(&block), (0, false));
    }

    #[test]
    fn discarded_blocks_lose_all_state() {
        let f = fixture();
        let handler = RecordingHandler::new(StorageLevel::NONE);
        let p = planner(&f, EvictionPolicy::Lru, handler.clone());

        let block = BlockId::dataset(1, 0);
        cache_block(&f, &block, 40);
        p.try_free(Some(&BlockId::dataset(2, 0)), 10, MemoryMode::OnHeap);

        assert!(f.refs.ref_of(&block).is_none());
        assert!(f.refs.current_ref(&block).is_none());
        assert!(!f.entries.contains(&block));
    }
}
