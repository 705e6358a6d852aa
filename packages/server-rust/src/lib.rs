//! `BlockGrid` Server — worker memory store, reference-aware eviction, and
//! the master block directory.

pub mod agent;
pub mod config;
pub mod master;
pub mod memory;

pub use agent::spawn_worker_agent;
pub use config::{MasterConfig, StoreConfig};
pub use master::{
    spawn_master, AskError, DirectoryEvent, Master, MasterHandle, StorageStatus, WorkerEndpoint,
};
pub use memory::{
    BlockEvictionHandler, DiscardingEvictionHandler, EvictedData, EvictionPolicy, MemoryStore,
    PeerMode,
};

/// Installs the process-wide tracing subscriber, honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
