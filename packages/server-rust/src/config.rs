//! Configuration for the worker store and the master directory.

use std::path::PathBuf;
use std::time::Duration;

use crate::memory::eviction::EvictionPolicy;
use crate::memory::reference::PeerMode;

/// Worker-level configuration for the memory store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of the on-heap region in bytes.
    pub max_on_heap_bytes: u64,
    /// Capacity of the off-heap region in bytes.
    pub max_off_heap_bytes: u64,
    /// Eviction policy the planner runs.
    pub policy: EvictionPolicy,
    /// Which peer-eviction broadcast this worker applies.
    pub peer_mode: PeerMode,
    /// First unroll reservation of an iterator put.
    pub unroll_initial_request: u64,
    /// Elements between unroll size re-estimates.
    pub unroll_check_period: usize,
    /// Reservation growth factor once the estimate crosses the threshold.
    pub unroll_growth_factor: f64,
    /// Chunk size of serialized entries.
    pub serialize_chunk_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_on_heap_bytes: 512 * 1024 * 1024,
            max_off_heap_bytes: 0,
            policy: EvictionPolicy::Lru,
            peer_mode: PeerMode::Conservative,
            unroll_initial_request: 1024 * 1024,
            unroll_check_period: 16,
            unroll_growth_factor: 1.5,
            serialize_chunk_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Master-level configuration for the directory endpoint.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Application name; also names the profile files (spaces stripped).
    pub app_name: String,
    /// Directory the profile files are loaded from.
    pub profile_dir: PathBuf,
    /// Directory the telemetry summary is appended to on shutdown.
    pub output_dir: PathBuf,
    /// Timeout of one ask round-trip.
    pub ask_timeout: Duration,
    /// Retries after a timed-out ask before the error surfaces.
    pub ask_retries: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            app_name: "blockgrid".to_string(),
            profile_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            ask_timeout: Duration::from_secs(30),
            ask_retries: 3,
        }
    }
}
