//! Access-ordered table of cached entries.
//!
//! Wraps an unbounded [`lru::LruCache`] behind a mutex: `get` promotes the
//! key to most-recently-used, `put` installs at the MRU end (so the initial
//! order is insertion order), and iteration snapshots keys from least- to
//! most-recently-accessed. The table never evicts on its own; capacity is
//! the memory account's business.

use lru::LruCache;
use parking_lot::Mutex;

use blockgrid_core::{BlockId, MemoryMode};

use super::entry::Entry;

/// Point-in-time view of one cached entry, used by the eviction planner.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub block: BlockId,
    pub size: u64,
    pub mode: MemoryMode,
}

/// Insertion-ordered map `BlockId -> Entry` with access-order promotion.
pub struct EntryTable {
    inner: Mutex<LruCache<BlockId, Entry>>,
}

impl Default for EntryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Installs an entry at the MRU end, returning any replaced entry.
    pub fn put(&self, block: BlockId, entry: Entry) -> Option<Entry> {
        self.inner.lock().put(block, entry)
    }

    /// Reads an entry and promotes it to most-recently-used.
    pub fn get(&self, block: &BlockId) -> Option<Entry> {
        self.inner.lock().get(block).cloned()
    }

    /// Reads an entry's size without touching access order.
    pub fn peek_size(&self, block: &BlockId) -> Option<u64> {
        self.inner.lock().peek(block).map(Entry::size)
    }

    /// Removes an entry.
    pub fn remove(&self, block: &BlockId) -> Option<Entry> {
        self.inner.lock().pop(block)
    }

    #[must_use]
    pub fn contains(&self, block: &BlockId) -> bool {
        self.inner.lock().contains(block)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of cached dataset blocks.
    #[must_use]
    pub fn dataset_block_count(&self) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|(block, _)| block.is_dataset())
            .count()
    }

    /// Snapshot of all entries ordered least-recently-accessed first.
    #[must_use]
    pub fn snapshot_lru_first(&self) -> Vec<EntrySnapshot> {
        self.inner
            .lock()
            .iter()
            .rev()
            .map(|(block, entry)| EntrySnapshot {
                block: block.clone(),
                size: entry.size(),
                mode: entry.mode(),
            })
            .collect()
    }
}
