//! Master-to-worker command messages and their replies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::block::{BlockId, DatasetId, JobId};
use crate::profile::DagInfo;

/// Top-level master-to-worker command.
///
/// Peer-eviction checks carry the master-stamped `event_id` so a worker can
/// apply each originating eviction event exactly once, however often the
/// message is replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    // -- Removal (4) ---------------------------------------------------------
    RemoveBlock { block: BlockId },
    RemoveDataset { dataset_id: DatasetId },
    RemoveShuffle { shuffle_id: u64 },
    RemoveBroadcast { broadcast_id: u64, from_driver: bool },

    // -- Profile broadcasts (2) ----------------------------------------------
    BroadcastJobDag {
        job: JobId,
        refs: Option<HashMap<DatasetId, i64>>,
    },
    BroadcastDagInfo {
        job: JobId,
        dag: Option<DagInfo>,
        access_number: u64,
    },

    // -- Peer eviction (2) ---------------------------------------------------
    CheckPeersStrictly { block: BlockId, event_id: u64 },
    CheckPeersConservatively { block: BlockId, event_id: u64 },

    // -- Diagnostics (1) -----------------------------------------------------
    TriggerThreadDump,
}

/// Reply a worker returns for a [`WorkerCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    /// Command applied; nothing to report.
    Ack,
    /// Outcome of a single-block removal.
    Bool { value: bool },
    /// Number of blocks removed by a bulk removal.
    Removed { count: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgpack_round_trip_commands() {
        let mut dag = DagInfo::new();
        dag.entry(2).or_default().insert(4, 1);

        let commands = vec![
            WorkerCommand::RemoveBlock {
                block: BlockId::dataset(1, 0),
            },
            WorkerCommand::RemoveDataset { dataset_id: 9 },
            WorkerCommand::BroadcastJobDag {
                job: 3,
                refs: Some(HashMap::from([(1, 5)])),
            },
            WorkerCommand::BroadcastDagInfo {
                job: 3,
                dag: Some(dag),
                access_number: 12,
            },
            WorkerCommand::CheckPeersConservatively {
                block: BlockId::dataset(1, 0),
                event_id: 7,
            },
            WorkerCommand::TriggerThreadDump,
        ];
        for cmd in commands {
            let bytes = rmp_serde::to_vec_named(&cmd).unwrap();
            let decoded: WorkerCommand = rmp_serde::from_slice(&bytes).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn msgpack_round_trip_replies() {
        for reply in [
            WorkerReply::Ack,
            WorkerReply::Bool { value: true },
            WorkerReply::Removed { count: 11 },
        ] {
            let bytes = rmp_serde::to_vec_named(&reply).unwrap();
            let decoded: WorkerReply = rmp_serde::from_slice(&bytes).unwrap();
            assert_eq!(decoded, reply);
        }
    }
}
