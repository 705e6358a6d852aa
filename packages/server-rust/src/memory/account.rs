//! Byte accounting for the bounded cache region.
//!
//! Storage bytes (installed entries) and unroll bytes (in-flight
//! materialization scratch) share one pool per memory mode but are tracked
//! independently, with unroll attributed to the reserving task so the store
//! can atomically trade unroll for storage when a put completes, and a
//! task-completion listener can drop whatever a dead task left behind.
//!
//! Two locks with distinct roles:
//!
//! - the *pools* mutex guards the byte counters and is held only for the
//!   duration of a single accounting update;
//! - the *admission* mutex serializes the check / evict / retry sequence of
//!   an acquisition, so concurrent admissions cannot both count the same
//!   freed bytes. The eviction callback runs under the admission mutex but
//!   never under the pools mutex, which lets the eviction handler re-enter
//!   [`release_storage`](MemoryAccount::release_storage).

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use blockgrid_core::{BlockId, MemoryMode, TaskId};

#[derive(Default, Debug)]
struct Pools {
    storage: [u64; 2],
    unroll: [u64; 2],
    unroll_by_task: HashMap<TaskId, [u64; 2]>,
}

impl Pools {
    fn used(&self, mode: MemoryMode) -> u64 {
        self.storage[mode.index()] + self.unroll[mode.index()]
    }
}

/// Tracks bytes reserved for storage vs unroll, per memory mode.
#[derive(Debug)]
pub struct MemoryAccount {
    max_bytes: [u64; 2],
    admission: Mutex<()>,
    pools: Mutex<Pools>,
}

impl MemoryAccount {
    #[must_use]
    pub fn new(max_on_heap_bytes: u64, max_off_heap_bytes: u64) -> Self {
        Self {
            max_bytes: [max_on_heap_bytes, max_off_heap_bytes],
            admission: Mutex::new(()),
            pools: Mutex::new(Pools::default()),
        }
    }

    /// Capacity of the on-heap region.
    #[must_use]
    pub fn max_on_heap_storage_bytes(&self) -> u64 {
        self.max_bytes[MemoryMode::OnHeap.index()]
    }

    /// Capacity of the given region.
    #[must_use]
    pub fn max_bytes(&self, mode: MemoryMode) -> u64 {
        self.max_bytes[mode.index()]
    }

    /// Bytes currently committed to installed entries.
    #[must_use]
    pub fn storage_used(&self, mode: MemoryMode) -> u64 {
        self.pools.lock().storage[mode.index()]
    }

    /// Bytes currently reserved as unroll scratch.
    #[must_use]
    pub fn unroll_used(&self, mode: MemoryMode) -> u64 {
        self.pools.lock().unroll[mode.index()]
    }

    /// Free bytes in the given region.
    #[must_use]
    pub fn free_bytes(&self, mode: MemoryMode) -> u64 {
        let pools = self.pools.lock();
        self.max_bytes[mode.index()].saturating_sub(pools.used(mode))
    }

    fn try_commit_storage(&self, needed: u64, mode: MemoryMode) -> bool {
        let mut pools = self.pools.lock();
        let free = self.max_bytes[mode.index()].saturating_sub(pools.used(mode));
        if needed <= free {
            pools.storage[mode.index()] += needed;
            true
        } else {
            false
        }
    }

    fn try_commit_unroll(&self, task: TaskId, needed: u64, mode: MemoryMode) -> bool {
        let mut pools = self.pools.lock();
        let free = self.max_bytes[mode.index()].saturating_sub(pools.used(mode));
        if needed <= free {
            pools.unroll[mode.index()] += needed;
            pools.unroll_by_task.entry(task).or_default()[mode.index()] += needed;
            true
        } else {
            false
        }
    }

    /// Reserves `needed` storage bytes for `block`, evicting through the
    /// supplied callback when the region is full.
    ///
    /// The callback receives the shortfall and returns the bytes it freed;
    /// the accounting update is then retried exactly once.
    pub fn acquire_storage(
        &self,
        block: Option<&BlockId>,
        needed: u64,
        mode: MemoryMode,
        evict: impl FnOnce(u64) -> u64,
    ) -> bool {
        let _admission = self.admission.lock();
        if self.try_commit_storage(needed, mode) {
            return true;
        }

        let shortfall = {
            let pools = self.pools.lock();
            needed.saturating_sub(self.max_bytes[mode.index()].saturating_sub(pools.used(mode)))
        };
        let freed = evict(shortfall);
        debug!(block = ?block, needed, freed, "storage acquisition evicted");
        self.try_commit_storage(needed, mode)
    }

    /// Reserves `needed` unroll bytes for `task`, evicting like
    /// [`acquire_storage`](Self::acquire_storage) when the region is full.
    pub fn acquire_unroll(
        &self,
        block: Option<&BlockId>,
        task: TaskId,
        needed: u64,
        mode: MemoryMode,
        evict: impl FnOnce(u64) -> u64,
    ) -> bool {
        let _admission = self.admission.lock();
        if self.try_commit_unroll(task, needed, mode) {
            return true;
        }

        let shortfall = {
            let pools = self.pools.lock();
            needed.saturating_sub(self.max_bytes[mode.index()].saturating_sub(pools.used(mode)))
        };
        let freed = evict(shortfall);
        debug!(block = ?block, task, needed, freed, "unroll acquisition evicted");
        self.try_commit_unroll(task, needed, mode)
    }

    /// Returns storage bytes to the pool.
    pub fn release_storage(&self, n: u64, mode: MemoryMode) {
        let mut pools = self.pools.lock();
        debug_assert!(pools.storage[mode.index()] >= n, "storage release underflow");
        pools.storage[mode.index()] = pools.storage[mode.index()].saturating_sub(n);
    }

    /// Returns up to `n` unroll bytes held by `task`; amounts beyond the
    /// task's holding are ignored.
    pub fn release_unroll(&self, task: TaskId, n: u64, mode: MemoryMode) {
        let mut pools = self.pools.lock();
        let Some(held) = pools.unroll_by_task.get_mut(&task) else {
            return;
        };
        let amount = n.min(held[mode.index()]);
        held[mode.index()] -= amount;
        if held == &[0, 0] {
            pools.unroll_by_task.remove(&task);
        }
        pools.unroll[mode.index()] -= amount;
    }

    /// Drops every unroll reservation of a finished task, returning the
    /// total released.
    pub fn release_all_unroll_for_task(&self, task: TaskId) -> u64 {
        let mut pools = self.pools.lock();
        let Some(held) = pools.unroll_by_task.remove(&task) else {
            return 0;
        };
        pools.unroll[0] -= held[0];
        pools.unroll[1] -= held[1];
        held[0] + held[1]
    }

    /// Atomically converts `n` of the task's unroll bytes into storage bytes
    /// under a single pools-mutex acquisition.
    ///
    /// The pool total is unchanged, so the transfer cannot fail for capacity
    /// reasons; a task holding fewer than `n` unroll bytes is a bookkeeping
    /// bug and panics.
    pub fn transfer_unroll_to_storage(&self, task: TaskId, n: u64, mode: MemoryMode) {
        let mut pools = self.pools.lock();
        let held = pools
            .unroll_by_task
            .get_mut(&task)
            .unwrap_or_else(|| panic!("task {task} has no unroll reservation to transfer"));
        assert!(
            held[mode.index()] >= n,
            "task {task} holds {} unroll bytes, cannot transfer {n}",
            held[mode.index()]
        );
        held[mode.index()] -= n;
        if held == &[0, 0] {
            pools.unroll_by_task.remove(&task);
        }
        pools.unroll[mode.index()] -= n;
        pools.storage[mode.index()] += n;
    }

    /// Drops every reservation; used by `MemoryStore::clear`.
    pub fn reset(&self) {
        *self.pools.lock() = Pools::default();
    }
}
