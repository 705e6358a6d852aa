//! Non-reentrant per-block read/write locks.
//!
//! Eviction takes non-blocking write locks on its victims; readers block
//! writers and vice versa. Lock state survives storage transitions (a block
//! spilled to disk keeps its table entry until removed), and the eviction
//! path releases its write lock explicitly once the post-eviction state has
//! settled, so the API is lock/unlock rather than RAII guards.
//!
//! The table is deliberately ignorant of which thread holds a lock: locks
//! are non-reentrant and a holder that re-acquires deadlocks itself, same as
//! the non-blocking variants simply observing "someone else holds this".

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

use blockgrid_core::BlockId;

#[derive(Debug, Default, Clone, Copy)]
struct LockState {
    readers: u32,
    writer: bool,
}

impl LockState {
    fn is_free(self) -> bool {
        self.readers == 0 && !self.writer
    }
}

/// Read/write locks keyed by block id.
///
/// States are created on demand and garbage-collected once fully released,
/// except for blocks explicitly pinned by an outstanding lock.
#[derive(Default)]
pub struct BlockLockTable {
    states: Mutex<HashMap<BlockId, LockState>>,
    released: Condvar,
}

impl BlockLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the write lock. With `blocking = false` the attempt fails
    /// immediately when any other holder exists, including readers.
    pub fn lock_for_writing(&self, block: &BlockId, blocking: bool) -> bool {
        let mut states = self.states.lock();
        loop {
            let state = states.entry(block.clone()).or_default();
            if state.is_free() {
                state.writer = true;
                return true;
            }
            if !blocking {
                return false;
            }
            self.released.wait(&mut states);
        }
    }

    /// Acquires a read lock. With `blocking = false` the attempt fails
    /// immediately when a writer holds the block.
    pub fn lock_for_reading(&self, block: &BlockId, blocking: bool) -> bool {
        let mut states = self.states.lock();
        loop {
            let state = states.entry(block.clone()).or_default();
            if !state.writer {
                state.readers += 1;
                return true;
            }
            if !blocking {
                return false;
            }
            self.released.wait(&mut states);
        }
    }

    /// Releases the write lock.
    pub fn unlock_write(&self, block: &BlockId) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(block) else {
            debug_assert!(false, "write unlock of untracked block {block}");
            return;
        };
        debug_assert!(state.writer, "write unlock without write lock on {block}");
        state.writer = false;
        if state.is_free() {
            states.remove(block);
        }
        drop(states);
        self.released.notify_all();
    }

    /// Releases one read lock.
    pub fn unlock_read(&self, block: &BlockId) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(block) else {
            debug_assert!(false, "read unlock of untracked block {block}");
            return;
        };
        debug_assert!(state.readers > 0, "read unlock without read lock on {block}");
        state.readers = state.readers.saturating_sub(1);
        if state.is_free() {
            states.remove(block);
        }
        drop(states);
        self.released.notify_all();
    }

    /// Drops the block's lock metadata entirely, releasing any lock the
    /// caller holds on it. Used when a block ceases to exist.
    pub fn remove_block(&self, block: &BlockId) {
        self.states.lock().remove(block);
        self.released.notify_all();
    }

    /// Drops all lock metadata.
    pub fn clear(&self) {
        self.states.lock().clear();
        self.released.notify_all();
    }

    /// `(readers, writer)` currently recorded for the block.
    #[must_use]
    pub fn holders(&self, block: &BlockId) -> (u32, bool) {
        self.states
            .lock()
            .get(block)
            .map_or((0, false), |s| (s.readers, s.writer))
    }
}
