//! Worker-to-master request messages.
//!
//! One enum variant per directory operation. Registration establishes the
//! reply endpoint out of band (the transport hands the directory a live
//! handle alongside the payload), so [`RegisterPayload`] carries identity and
//! capacity only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::block::{BlockId, BlockIdFilter, DatasetId, JobId};
use crate::level::StorageLevel;
use crate::profile::DagInfo;
use crate::worker::BlockManagerId;

// ---------------------------------------------------------------------------
// Supporting payloads
// ---------------------------------------------------------------------------

/// Payload for a worker announcing itself to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub worker: BlockManagerId,
    pub max_mem_bytes: u64,
}

/// Payload reporting one block's placement on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBlockInfoPayload {
    pub worker: BlockManagerId,
    pub block: BlockId,
    pub storage_level: StorageLevel,
    pub mem_size: u64,
    pub disk_size: u64,
}

// ---------------------------------------------------------------------------
// MasterMessage enum
// ---------------------------------------------------------------------------

/// Top-level worker-to-master request.
///
/// Internally tagged on `"type"` with `SCREAMING_SNAKE_CASE` variant names.
/// Covers registration and placement (3), pure reads (8), telemetry and
/// profiles (3), peer eviction (1), profile broadcasts (3), removal fan-outs
/// (4), and lifecycle (2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterMessage {
    // -- Registration / placement (3) --------------------------------------
    Register(RegisterPayload),
    UpdateBlockInfo(UpdateBlockInfoPayload),
    Heartbeat { worker: BlockManagerId },

    // -- Pure reads (8) ----------------------------------------------------
    GetLocations { block: BlockId },
    GetLocationsMultiple { blocks: Vec<BlockId> },
    GetPeers { worker: BlockManagerId },
    GetExecutorEndpoint { executor_id: String },
    GetMemoryStatus,
    GetStorageStatus,
    GetBlockStatus { block: BlockId, ask_workers: bool },
    GetMatchingBlockIds { filter: BlockIdFilter, ask_workers: bool },

    // -- Telemetry / profiles (3) -------------------------------------------
    HasCachedBlocks { executor_id: String },
    ReportCacheHit { worker: BlockManagerId, deltas: [u64; 4] },
    GetRefProfile { worker: BlockManagerId },

    // -- Peer eviction (1) ---------------------------------------------------
    BlockWithPeerEvicted { block: BlockId },

    // -- Profile broadcasts (3) ---------------------------------------------
    StartBroadcastJobId { job: JobId },
    StartBroadcastRefCount {
        job: JobId,
        partitions: u32,
        refs: HashMap<DatasetId, i64>,
    },
    StartBroadcastDagInfo {
        job: JobId,
        partitions: u32,
        dag: DagInfo,
        access_number: u64,
    },

    // -- Removal fan-outs (4) -----------------------------------------------
    RemoveDataset { dataset_id: DatasetId },
    RemoveShuffle { shuffle_id: u64 },
    RemoveBroadcast { broadcast_id: u64, from_driver: bool },
    RemoveExecutor { executor_id: String },

    // -- Lifecycle (1) -------------------------------------------------------
    Stop,
}
