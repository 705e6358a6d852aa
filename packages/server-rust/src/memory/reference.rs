//! Per-block reference counts, per-dataset leases, and peer bookkeeping.
//!
//! The model mirrors what the master knows about dataset reuse onto this
//! worker's cached blocks:
//!
//! - `ref_map` tracks the remaining references of every block this worker
//!   has seen, across storage tiers; `current_ref_map` restricts that to
//!   blocks presently held in memory.
//! - `lease_map` holds the lease lengths computed from the latest DAG
//!   broadcast; `current_lease` counts down the remaining protection of each
//!   presently-cached dataset.
//! - `peer_lost_blocks` parks the pending decrement for a peer block that
//!   was evicted elsewhere before this worker cached its counterpart.
//!
//! Each map has its own mutex; methods hold at most two at a time, and the
//! few nested acquisitions all run in a single direction, so the locks
//! cannot deadlock against each other.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, warn};

use blockgrid_core::{BlockId, DagInfo, DatasetId, JobId, ProfileBundle};

/// How this worker reacts to a peer-eviction broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Decrement only the evicted block and its direct counterpart.
    Conservative,
    /// Decrement the profiles and every tracked block of both datasets.
    Strict,
}

/// Reference and lease state of one worker.
#[derive(Default)]
pub struct ReferenceModel {
    ref_profile: Mutex<HashMap<DatasetId, i64>>,
    ref_profile_by_job: Mutex<HashMap<JobId, HashMap<DatasetId, i64>>>,
    peer_profile: Mutex<HashMap<DatasetId, DatasetId>>,
    ref_map: Mutex<HashMap<BlockId, i64>>,
    current_ref_map: Mutex<HashMap<BlockId, i64>>,
    dag_info: Mutex<DagInfo>,
    current_dag_info: Mutex<DagInfo>,
    lease_map: Mutex<HashMap<DatasetId, i64>>,
    current_lease: Mutex<HashMap<DatasetId, i64>>,
    peer_lost_blocks: Mutex<HashSet<BlockId>>,
    applied_peer_events: Mutex<HashSet<u64>>,
}

impl ReferenceModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the profile triple fetched from the master at startup.
    pub fn install_profiles(&self, bundle: ProfileBundle) {
        *self.ref_profile.lock() = bundle.ref_profile;
        *self.ref_profile_by_job.lock() = bundle.ref_profile_by_job;
        *self.peer_profile.lock() = bundle.peer_profile;
    }

    // -- Ingestion -----------------------------------------------------------

    /// Records a freshly installed dataset block.
    ///
    /// Returns `false` when the block was already tracked (re-admission of a
    /// spilled block keeps its surviving reference count). Non-dataset
    /// blocks are not tracked at all.
    pub fn register_block(&self, block: &BlockId) -> bool {
        let Some(dataset) = block.dataset_id() else {
            return true;
        };

        let profiled = self.ref_profile.lock().get(&dataset).copied();
        let duplicate = {
            let mut ref_map = self.ref_map.lock();
            if ref_map.contains_key(block) {
                debug!(block = %block, "duplicate ingestion, keeping existing reference count");
                true
            } else {
                ref_map.insert(block.clone(), profiled.unwrap_or(1));
                false
            }
        };

        let histogram = self.dag_info.lock().get(&dataset).cloned();
        if let Some(histogram) = histogram {
            self.current_dag_info.lock().insert(dataset, histogram);
            let lease = self.lease_map.lock().get(&dataset).copied().unwrap_or(0);
            self.current_lease.lock().insert(dataset, lease);
        }

        if self.peer_lost_blocks.lock().remove(block) {
            debug!(block = %block, "applying pending peer-eviction decrement");
            if let Some(count) = self.ref_map.lock().get_mut(block) {
                *count = (*count - 1).max(0);
            }
        }

        let remaining = self.ref_map.lock().get(block).copied().unwrap_or(0);
        self.current_ref_map.lock().insert(block.clone(), remaining);
        !duplicate
    }

    // -- Access --------------------------------------------------------------

    /// A read served from memory: both reference views lose one use.
    pub fn on_hit(&self, block: &BlockId) {
        if !block.is_dataset() {
            return;
        }
        if let Some(count) = self.ref_map.lock().get_mut(block) {
            *count = (*count - 1).max(0);
        }
        if let Some(count) = self.current_ref_map.lock().get_mut(block) {
            *count = (*count - 1).max(0);
        }
    }

    /// A read that missed (or a recomputation): only the tier-wide view
    /// loses a use.
    pub fn on_miss(&self, block: &BlockId) {
        if !block.is_dataset() {
            return;
        }
        if let Some(count) = self.ref_map.lock().get_mut(block) {
            *count = (*count - 1).max(0);
        }
    }

    /// Advances lease time by one access: every cached dataset's remaining
    /// lease drops by one (floor zero), then the accessed dataset is
    /// refreshed to its full assigned lease.
    pub fn tick_access(&self, accessed: DatasetId) {
        let mut current = self.current_lease.lock();
        for lease in current.values_mut() {
            *lease = (*lease - 1).max(0);
        }
        if let Some(assigned) = self.lease_map.lock().get(&accessed) {
            current.insert(accessed, *assigned);
        }
    }

    // -- Eviction / removal --------------------------------------------------

    /// Clears cached-tier state after a block leaves memory.
    ///
    /// The dataset's `current_*` entries go in both cases; the tier-wide
    /// `ref_map` entry survives only when the block was spilled rather than
    /// discarded.
    pub fn on_evicted(&self, block: &BlockId, retained_on_disk: bool) {
        self.current_ref_map.lock().remove(block);
        if let Some(dataset) = block.dataset_id() {
            self.current_dag_info.lock().remove(&dataset);
            self.current_lease.lock().remove(&dataset);
        }
        if !retained_on_disk {
            self.ref_map.lock().remove(block);
        }
    }

    /// Drops all cached-tier block state; profiles and lease assignments
    /// survive.
    pub fn clear_cached(&self) {
        self.ref_map.lock().clear();
        self.current_ref_map.lock().clear();
        self.current_dag_info.lock().clear();
        self.current_lease.lock().clear();
    }

    // -- Job profiles --------------------------------------------------------

    /// Applies a per-job reference map: replaces the profile entry and
    /// rewrites every tracked block of the named datasets.
    ///
    /// With `refs = None` the worker falls back to the per-job map it
    /// fetched at startup.
    pub fn apply_job_profile(&self, job: JobId, refs: Option<HashMap<DatasetId, i64>>) {
        let refs = match refs {
            Some(refs) => refs,
            None => match self.ref_profile_by_job.lock().get(&job).cloned() {
                Some(refs) => refs,
                None => {
                    warn!(job, "job profile broadcast without a reference map");
                    return;
                }
            },
        };

        {
            let mut profile = self.ref_profile.lock();
            for (&dataset, &count) in &refs {
                profile.insert(dataset, count);
            }
        }
        {
            let mut ref_map = self.ref_map.lock();
            for (block, count) in ref_map.iter_mut() {
                if let Some(new) = block.dataset_id().and_then(|d| refs.get(&d)) {
                    *count = *new;
                }
            }
        }
        {
            let mut current = self.current_ref_map.lock();
            for (block, count) in current.iter_mut() {
                if let Some(new) = block.dataset_id().and_then(|d| refs.get(&d)) {
                    *count = *new;
                }
            }
        }
        debug!(job, datasets = refs.len(), "applied job reference profile");
    }

    /// Replaces the DAG histograms; the caller recomputes leases afterwards.
    pub fn replace_dag_info(&self, dag: DagInfo) {
        *self.dag_info.lock() = dag;
    }

    /// Installs a freshly computed lease assignment, replacing the old one.
    pub fn set_lease_map(&self, leases: HashMap<DatasetId, i64>) {
        *self.lease_map.lock() = leases;
    }

    // -- Peer eviction -------------------------------------------------------

    /// Claims the event id; `false` means this event was already applied.
    fn claim_event(&self, event_id: u64) -> bool {
        self.applied_peer_events.lock().insert(event_id)
    }

    fn decrement_block(&self, block: &BlockId) {
        if let Some(count) = self.ref_map.lock().get_mut(block) {
            *count = (*count - 1).max(0);
        }
        if let Some(count) = self.current_ref_map.lock().get_mut(block) {
            *count = (*count - 1).max(0);
        }
    }

    /// Conservative peer handling: the evicted block and its direct
    /// counterpart each lose one reference; an unknown counterpart is parked
    /// for replay on arrival.
    pub fn check_peers_conservative(&self, block: &BlockId, event_id: u64) {
        if !self.claim_event(event_id) {
            return;
        }
        let (Some(dataset), &BlockId::Dataset { partition, .. }) = (block.dataset_id(), block)
        else {
            warn!(block = %block, "peer eviction notice for a non-dataset block");
            return;
        };
        let Some(peer) = self.peer_profile.lock().get(&dataset).copied() else {
            debug!(block = %block, dataset, "no peer recorded for evicted block");
            return;
        };

        self.decrement_block(block);

        let counterpart = BlockId::dataset(peer, partition);
        if self.ref_map.lock().contains_key(&counterpart) {
            self.decrement_block(&counterpart);
        } else {
            debug!(block = %counterpart, "counterpart unknown, parking peer decrement");
            self.peer_lost_blocks.lock().insert(counterpart);
        }
    }

    /// Strict peer handling: both datasets lose one reference in the profile
    /// and on every tracked block.
    pub fn check_peers_strict(&self, block: &BlockId, event_id: u64) {
        if !self.claim_event(event_id) {
            return;
        }
        let Some(dataset) = block.dataset_id() else {
            warn!(block = %block, "peer eviction notice for a non-dataset block");
            return;
        };
        let Some(peer) = self.peer_profile.lock().get(&dataset).copied() else {
            debug!(block = %block, dataset, "no peer recorded for evicted block");
            return;
        };

        {
            let mut profile = self.ref_profile.lock();
            for d in [dataset, peer] {
                if let Some(count) = profile.get_mut(&d) {
                    *count = (*count - 1).max(0);
                }
            }
        }
        {
            let mut ref_map = self.ref_map.lock();
            for (b, count) in ref_map.iter_mut() {
                if matches!(b.dataset_id(), Some(d) if d == dataset || d == peer) {
                    *count = (*count - 1).max(0);
                }
            }
        }
        {
            let mut current = self.current_ref_map.lock();
            for (b, count) in current.iter_mut() {
                if matches!(b.dataset_id(), Some(d) if d == dataset || d == peer) {
                    *count = (*count - 1).max(0);
                }
            }
        }
    }

    // -- Read accessors ------------------------------------------------------

    /// In-memory reference count of a cached block.
    #[must_use]
    pub fn current_ref(&self, block: &BlockId) -> Option<i64> {
        self.current_ref_map.lock().get(block).copied()
    }

    /// Tier-wide reference count of a tracked block.
    #[must_use]
    pub fn ref_of(&self, block: &BlockId) -> Option<i64> {
        self.ref_map.lock().get(block).copied()
    }

    /// Reference count an incoming block competes with during LRC eviction.
    ///
    /// Broadcast and other non-dataset blocks are always worth admitting.
    #[must_use]
    pub fn incoming_ref_for(&self, block: &BlockId) -> i64 {
        let Some(dataset) = block.dataset_id() else {
            return i64::MAX;
        };
        if let Some(count) = self.ref_map.lock().get(block) {
            return *count;
        }
        self.ref_profile.lock().get(&dataset).copied().unwrap_or(1)
    }

    /// Remaining lease of a presently-cached dataset.
    #[must_use]
    pub fn current_lease_of(&self, dataset: DatasetId) -> Option<i64> {
        self.current_lease.lock().get(&dataset).copied()
    }

    /// Lease the planner compares an admission candidate against: the
    /// dataset's remaining lease if cached, else its assigned lease, else
    /// zero.
    #[must_use]
    pub fn lease_for_admission(&self, dataset: DatasetId) -> i64 {
        if let Some(lease) = self.current_lease.lock().get(&dataset) {
            return *lease;
        }
        self.lease_map.lock().get(&dataset).copied().unwrap_or(0)
    }

    /// Datasets whose remaining lease has run out.
    #[must_use]
    pub fn expired_lease_datasets(&self) -> HashSet<DatasetId> {
        self.current_lease
            .lock()
            .iter()
            .filter(|(_, lease)| **lease <= 0)
            .map(|(dataset, _)| *dataset)
            .collect()
    }

    /// Snapshot of the remaining leases of cached datasets.
    #[must_use]
    pub fn current_lease_snapshot(&self) -> HashMap<DatasetId, i64> {
        self.current_lease.lock().clone()
    }

    /// Snapshot of the installed DAG histograms.
    #[must_use]
    pub fn dag_info_snapshot(&self) -> DagInfo {
        self.dag_info.lock().clone()
    }

    /// Assigned lease of a dataset.
    #[must_use]
    pub fn assigned_lease(&self, dataset: DatasetId) -> Option<i64> {
        self.lease_map.lock().get(&dataset).copied()
    }
}

#[cfg(test)]
mod tests {
    use blockgrid_core::ReuseHistogram;

    use super::*;

    fn model_with_profile(refs: &[(DatasetId, i64)]) -> ReferenceModel {
        let model = ReferenceModel::new();
        model.install_profiles(ProfileBundle {
            ref_profile: refs.iter().copied().collect(),
            ..ProfileBundle::default()
        });
        model
    }

    #[test]
    fn registration_uses_profile_or_degenerate_one() {
        let model = model_with_profile(&[(1, 5)]);

        let profiled = BlockId::dataset(1, 0);
        assert!(model.register_block(&profiled));
        assert_eq!(model.ref_of(&profiled), Some(5));
        assert_eq!(model.current_ref(&profiled), Some(5));

        let unprofiled = BlockId::dataset(9, 0);
        assert!(model.register_block(&unprofiled));
        assert_eq!(model.ref_of(&unprofiled), Some(1));
    }

    #[test]
    fn duplicate_registration_keeps_count() {
        let model = model_with_profile(&[(1, 5)]);
        let block = BlockId::dataset(1, 0);
        assert!(model.register_block(&block));
        model.on_hit(&block);
        assert_eq!(model.ref_of(&block), Some(4));

        // Re-admission after a spill must not reset the count.
        assert!(!model.register_block(&block));
        assert_eq!(model.ref_of(&block), Some(4));
        assert_eq!(model.current_ref(&block), Some(4));
    }

    #[test]
    fn hits_decrement_both_views_misses_only_one() {
        let model = model_with_profile(&[(1, 3)]);
        let block = BlockId::dataset(1, 0);
        model.register_block(&block);

        model.on_hit(&block);
        assert_eq!(model.ref_of(&block), Some(2));
        assert_eq!(model.current_ref(&block), Some(2));

        model.on_miss(&block);
        assert_eq!(model.ref_of(&block), Some(1));
        assert_eq!(model.current_ref(&block), Some(2));
    }

    #[test]
    fn counts_never_go_negative() {
        let model = model_with_profile(&[(1, 0)]);
        let block = BlockId::dataset(1, 0);
        model.register_block(&block);
        model.on_hit(&block);
        assert_eq!(model.ref_of(&block), Some(0));
        assert_eq!(model.current_ref(&block), Some(0));
    }

    #[test]
    fn registration_installs_lease_state_when_dag_present() {
        let model = ReferenceModel::new();
        let mut dag = DagInfo::new();
        dag.insert(1, ReuseHistogram::from([(2, 1)]));
        model.replace_dag_info(dag);
        model.set_lease_map(HashMap::from([(1, 2)]));

        model.register_block(&BlockId::dataset(1, 0));
        assert_eq!(model.current_lease_of(1), Some(2));

        // Dataset 2 has no histogram: no lease state.
        model.register_block(&BlockId::dataset(2, 0));
        assert!(model.current_lease_of(2).is_none());
    }

    #[test]
    fn tick_decrements_and_refreshes_accessed_dataset() {
        let model = ReferenceModel::new();
        let mut dag = DagInfo::new();
        dag.insert(1, ReuseHistogram::from([(2, 1)]));
        dag.insert(2, ReuseHistogram::from([(4, 1)]));
        model.replace_dag_info(dag);
        model.set_lease_map(HashMap::from([(1, 2), (2, 4)]));
        model.register_block(&BlockId::dataset(1, 0));
        model.register_block(&BlockId::dataset(2, 0));

        model.tick_access(1);
        assert_eq!(model.current_lease_of(1), Some(2));
        assert_eq!(model.current_lease_of(2), Some(3));

        model.tick_access(2);
        model.tick_access(2);
        assert_eq!(model.current_lease_of(1), Some(0));
        assert_eq!(model.current_lease_of(2), Some(4));
        assert_eq!(model.expired_lease_datasets(), HashSet::from([1]));
    }

    #[test]
    fn eviction_clears_current_state_spill_keeps_ref_map() {
        let model = model_with_profile(&[(1, 4)]);
        let mut dag = DagInfo::new();
        dag.insert(1, ReuseHistogram::from([(3, 1)]));
        model.replace_dag_info(dag);
        model.set_lease_map(HashMap::from([(1, 3)]));
        let block = BlockId::dataset(1, 0);
        model.register_block(&block);

        model.on_evicted(&block, true);
        assert_eq!(model.ref_of(&block), Some(4));
        assert!(model.current_ref(&block).is_none());
        assert!(model.current_lease_of(1).is_none());

        model.register_block(&block);
        model.on_evicted(&block, false);
        assert!(model.ref_of(&block).is_none());
    }

    #[test]
    fn job_profile_replaces_counts() {
        let model = model_with_profile(&[(1, 2), (2, 2)]);
        let b1 = BlockId::dataset(1, 0);
        let b2 = BlockId::dataset(2, 0);
        model.register_block(&b1);
        model.register_block(&b2);

        model.apply_job_profile(7, Some(HashMap::from([(1, 9)])));
        assert_eq!(model.ref_of(&b1), Some(9));
        assert_eq!(model.current_ref(&b1), Some(9));
        assert_eq!(model.ref_of(&b2), Some(2));
    }

    #[test]
    fn job_profile_falls_back_to_startup_map() {
        let model = ReferenceModel::new();
        model.install_profiles(ProfileBundle {
            ref_profile_by_job: HashMap::from([(3, HashMap::from([(1, 6)]))]),
            ..ProfileBundle::default()
        });
        let b1 = BlockId::dataset(1, 0);
        model.register_block(&b1);

        model.apply_job_profile(3, None);
        assert_eq!(model.ref_of(&b1), Some(6));
    }

    #[test]
    fn conservative_peer_decrements_both_blocks() {
        let model = ReferenceModel::new();
        model.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 3), (2, 3)]),
            peer_profile: HashMap::from([(1, 2), (2, 1)]),
            ..ProfileBundle::default()
        });
        let b1 = BlockId::dataset(1, 4);
        let b2 = BlockId::dataset(2, 4);
        model.register_block(&b1);
        model.register_block(&b2);

        model.check_peers_conservative(&b1, 100);
        assert_eq!(model.ref_of(&b1), Some(2));
        assert_eq!(model.ref_of(&b2), Some(2));
    }

    #[test]
    fn conservative_peer_parks_unknown_counterpart() {
        let model = ReferenceModel::new();
        model.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 3), (2, 3)]),
            peer_profile: HashMap::from([(1, 2), (2, 1)]),
            ..ProfileBundle::default()
        });
        let b1 = BlockId::dataset(1, 4);
        model.register_block(&b1);

        model.check_peers_conservative(&b1, 100);

        // Counterpart arrives later: pending decrement applies exactly once.
        let b2 = BlockId::dataset(2, 4);
        model.register_block(&b2);
        assert_eq!(model.ref_of(&b2), Some(2));
        assert_eq!(model.current_ref(&b2), Some(2));

        model.on_evicted(&b2, false);
        model.register_block(&b2);
        assert_eq!(model.ref_of(&b2), Some(3));
    }

    #[test]
    fn peer_events_are_applied_exactly_once() {
        let model = ReferenceModel::new();
        model.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 3), (2, 3)]),
            peer_profile: HashMap::from([(1, 2), (2, 1)]),
            ..ProfileBundle::default()
        });
        let b1 = BlockId::dataset(1, 0);
        model.register_block(&b1);

        model.check_peers_conservative(&b1, 55);
        model.check_peers_conservative(&b1, 55);
        assert_eq!(model.ref_of(&b1), Some(2));

        // The strict twin of the same event is also deduplicated.
        model.check_peers_strict(&b1, 55);
        assert_eq!(model.ref_of(&b1), Some(2));
    }

    #[test]
    fn strict_peer_decrements_profiles_and_all_blocks() {
        let model = ReferenceModel::new();
        model.install_profiles(ProfileBundle {
            ref_profile: HashMap::from([(1, 3), (2, 3), (5, 3)]),
            peer_profile: HashMap::from([(1, 2), (2, 1)]),
            ..ProfileBundle::default()
        });
        let blocks = [
            BlockId::dataset(1, 0),
            BlockId::dataset(1, 1),
            BlockId::dataset(2, 0),
            BlockId::dataset(5, 0),
        ];
        for b in &blocks {
            model.register_block(b);
        }

        model.check_peers_strict(&BlockId::dataset(1, 0), 200);
        assert_eq!(model.ref_of(&blocks[0]), Some(2));
        assert_eq!(model.ref_of(&blocks[1]), Some(2));
        assert_eq!(model.ref_of(&blocks[2]), Some(2));
        // Unrelated dataset untouched.
        assert_eq!(model.ref_of(&blocks[3]), Some(3));
        // New admissions of the affected datasets see the decremented profile.
        assert_eq!(model.incoming_ref_for(&BlockId::dataset(1, 9)), 2);
    }

    #[test]
    fn incoming_ref_is_infinite_for_broadcast() {
        let model = model_with_profile(&[(1, 2)]);
        assert_eq!(
            model.incoming_ref_for(&BlockId::Broadcast { broadcast_id: 1 }),
            i64::MAX
        );
        assert_eq!(model.incoming_ref_for(&BlockId::dataset(1, 0)), 2);
        assert_eq!(model.incoming_ref_for(&BlockId::dataset(7, 0)), 1);
    }
}
