//! Worker-side command loop.
//!
//! Each worker drains the receiver half of its [`WorkerEndpoint`] and
//! applies master commands to its [`MemoryStore`]. Store operations are
//! synchronous and short; the loop applies one command at a time, which
//! also gives master broadcasts a per-worker total order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use blockgrid_core::messages::worker::{WorkerCommand, WorkerReply};
use blockgrid_core::BlockIdFilter;

use crate::master::WorkerCall;
use crate::memory::MemoryStore;

/// Applies one master command to the store and builds the reply.
fn apply_command(store: &MemoryStore, command: WorkerCommand) -> WorkerReply {
    match command {
        WorkerCommand::RemoveBlock { block } => WorkerReply::Bool {
            value: store.remove(&block),
        },
        WorkerCommand::RemoveDataset { dataset_id } => WorkerReply::Removed {
            count: store.remove_matching(&BlockIdFilter::Dataset { dataset_id }),
        },
        WorkerCommand::RemoveShuffle { shuffle_id } => WorkerReply::Removed {
            count: store.remove_matching(&BlockIdFilter::Shuffle { shuffle_id }),
        },
        WorkerCommand::RemoveBroadcast {
            broadcast_id,
            from_driver,
        } => {
            debug!(broadcast_id, from_driver, "removing broadcast");
            WorkerReply::Removed {
                count: store.remove_matching(&BlockIdFilter::Broadcast { broadcast_id }),
            }
        }
        WorkerCommand::BroadcastJobDag { job, refs } => {
            store.apply_job_profile(job, refs);
            WorkerReply::Ack
        }
        WorkerCommand::BroadcastDagInfo {
            job,
            dag,
            access_number,
        } => {
            debug!(job, access_number, "applying DAG broadcast");
            store.update_dag_info(dag, access_number);
            WorkerReply::Ack
        }
        WorkerCommand::CheckPeersConservatively { block, event_id } => {
            store.check_peers_conservatively(&block, event_id);
            WorkerReply::Ack
        }
        WorkerCommand::CheckPeersStrictly { block, event_id } => {
            store.check_peers_strictly(&block, event_id);
            WorkerReply::Ack
        }
        WorkerCommand::TriggerThreadDump => {
            warn!("thread dump requested but not supported on this worker");
            WorkerReply::Ack
        }
    }
}

/// Spawns the command loop binding `store` to an endpoint receiver.
pub fn spawn_worker_agent(
    store: Arc<MemoryStore>,
    mut commands: mpsc::UnboundedReceiver<WorkerCall>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(call) = commands.recv().await {
            let reply = apply_command(&store, call.command);
            let _ = call.reply.send(reply);
        }
        debug!("worker command loop drained");
    })
}

#[cfg(test)]
mod tests {
    use blockgrid_core::{BlockId, MemoryMode};

    use crate::config::StoreConfig;
    use crate::memory::{ChunkedByteBuffer, DiscardingEvictionHandler};

    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(
            StoreConfig::default(),
            Arc::new(DiscardingEvictionHandler),
        )
    }

    fn put(store: &MemoryStore, block: &BlockId) {
        assert!(store.put_bytes(block, 8, MemoryMode::OnHeap, || {
            ChunkedByteBuffer::from_vec(vec![0; 8])
        }));
    }

    #[test]
    fn remove_block_reports_outcome() {
        let store = store();
        let block = BlockId::dataset(1, 0);
        put(&store, &block);

        let reply = apply_command(
            &store,
            WorkerCommand::RemoveBlock {
                block: block.clone(),
            },
        );
        assert_eq!(reply, WorkerReply::Bool { value: true });

        let reply = apply_command(&store, WorkerCommand::RemoveBlock { block });
        assert_eq!(reply, WorkerReply::Bool { value: false });
    }

    #[test]
    fn bulk_removals_count_matches() {
        let store = store();
        put(&store, &BlockId::dataset(3, 0));
        put(&store, &BlockId::dataset(3, 1));
        put(&store, &BlockId::dataset(4, 0));

        let reply = apply_command(&store, WorkerCommand::RemoveDataset { dataset_id: 3 });
        assert_eq!(reply, WorkerReply::Removed { count: 2 });
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn thread_dump_is_acknowledged() {
        let store = store();
        assert_eq!(
            apply_command(&store, WorkerCommand::TriggerThreadDump),
            WorkerReply::Ack
        );
    }
}
