//! Storage levels, memory modes, and per-block status.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MemoryMode
// ---------------------------------------------------------------------------

/// Which memory region a cached entry occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemoryMode {
    OnHeap,
    OffHeap,
}

impl MemoryMode {
    /// Stable index for per-mode accounting arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::OnHeap => 0,
            Self::OffHeap => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// StorageLevel
// ---------------------------------------------------------------------------

/// Where and how a block may be stored.
///
/// A level is valid only if at least one tier is enabled and replication is
/// positive; an invalid level reported through `UpdateBlockInfo` means the
/// block left that worker entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageLevel {
    pub use_memory: bool,
    pub use_disk: bool,
    pub use_off_heap: bool,
    /// Stored as deserialized values rather than serialized bytes.
    pub deserialized: bool,
    pub replication: u32,
}

impl StorageLevel {
    /// Block is gone from the reporting worker.
    pub const NONE: Self = Self::new(false, false, false, false, 1);
    pub const DISK_ONLY: Self = Self::new(false, true, false, false, 1);
    pub const MEMORY_ONLY: Self = Self::new(true, false, false, true, 1);
    pub const MEMORY_ONLY_SER: Self = Self::new(true, false, false, false, 1);
    pub const MEMORY_AND_DISK: Self = Self::new(true, true, false, true, 1);
    pub const MEMORY_AND_DISK_SER: Self = Self::new(true, true, false, false, 1);
    pub const OFF_HEAP: Self = Self::new(true, false, true, false, 1);

    #[must_use]
    pub const fn new(
        use_memory: bool,
        use_disk: bool,
        use_off_heap: bool,
        deserialized: bool,
        replication: u32,
    ) -> Self {
        Self {
            use_memory,
            use_disk,
            use_off_heap,
            deserialized,
            replication,
        }
    }

    /// A level describes an actually-stored block.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (self.use_memory || self.use_disk) && self.replication > 0
    }

    /// Memory region implied by the level.
    #[must_use]
    pub fn memory_mode(&self) -> MemoryMode {
        if self.use_off_heap {
            MemoryMode::OffHeap
        } else {
            MemoryMode::OnHeap
        }
    }
}

// ---------------------------------------------------------------------------
// BlockStatus
// ---------------------------------------------------------------------------

/// Size and placement of one block on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStatus {
    pub storage_level: StorageLevel,
    pub mem_size: u64,
    pub disk_size: u64,
}

impl BlockStatus {
    /// Status of a block that is not stored anywhere.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            storage_level: StorageLevel::NONE,
            mem_size: 0,
            disk_size: 0,
        }
    }

    /// A block counts as cached while any tier holds bytes for it.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.mem_size + self.disk_size > 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_requires_a_tier_and_replication() {
        assert!(StorageLevel::MEMORY_ONLY.is_valid());
        assert!(StorageLevel::DISK_ONLY.is_valid());
        assert!(!StorageLevel::NONE.is_valid());

        let zero_rep = StorageLevel::new(true, true, false, true, 0);
        assert!(!zero_rep.is_valid());
    }

    #[test]
    fn memory_mode_follows_off_heap_flag() {
        assert_eq!(StorageLevel::MEMORY_ONLY.memory_mode(), MemoryMode::OnHeap);
        assert_eq!(StorageLevel::OFF_HEAP.memory_mode(), MemoryMode::OffHeap);
    }

    #[test]
    fn cached_iff_bytes_present() {
        let mut status = BlockStatus::empty();
        assert!(!status.is_cached());

        status.mem_size = 10;
        assert!(status.is_cached());

        status.mem_size = 0;
        status.disk_size = 5;
        assert!(status.is_cached());
    }

    #[test]
    fn mode_indices_are_distinct() {
        assert_ne!(MemoryMode::OnHeap.index(), MemoryMode::OffHeap.index());
    }
}
