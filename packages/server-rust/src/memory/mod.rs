//! Worker-side memory engine.
//!
//! Layered bottom-up: the [`account`] tracks bytes, the [`lock_table`]
//! guards per-block access, the [`entry_table`] keeps cached entries in
//! access order, the [`reference`] model mirrors dataset reuse knowledge,
//! the [`lease`] engine turns reuse histograms into lease assignments, the
//! [`eviction`] planner picks victims under a policy, and the [`store`] ties
//! it all together behind the public put/get/remove API.

pub mod account;
pub mod entry;
pub mod entry_table;
pub mod eviction;
pub mod lease;
pub mod lock_table;
pub mod reference;
pub mod store;

pub use account::MemoryAccount;
pub use entry::{ChunkedBufferWriter, ChunkedByteBuffer, Entry};
pub use entry_table::{EntrySnapshot, EntryTable};
pub use eviction::{
    BlockEvictionHandler, DiscardingEvictionHandler, EvictedData, EvictionPlanner, EvictionPolicy,
};
pub use lease::compute_lease_map;
pub use lock_table::BlockLockTable;
pub use reference::{PeerMode, ReferenceModel};
pub use store::{MemoryStore, PartiallySerializedBlock, PartiallyUnrolledIterator};
