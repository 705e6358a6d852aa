//! Master mailbox endpoint and worker endpoints.
//!
//! The directory runs as one task draining a request channel: a message is
//! handled to completion before the next is taken, so the directory state
//! needs no locks. Fan-out commands to workers are collected by spawned
//! tasks whose results come back through a future; the mailbox never awaits
//! them.
//!
//! Every ask carries a timeout and is retried a bounded number of times;
//! timeouts never mutate state, so a retry simply re-sends.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use blockgrid_core::messages::master::{MasterMessage, RegisterPayload, UpdateBlockInfoPayload};
use blockgrid_core::messages::worker::{WorkerCommand, WorkerReply};
use blockgrid_core::{BlockId, BlockIdFilter, BlockManagerId, BlockStatus, ProfileBundle};

use crate::config::MasterConfig;

use super::directory::{DirectoryEvent, MasterDirectory, StorageStatus};
use super::profiles::load_profiles;
use super::telemetry::TelemetryBundle;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of an ask round-trip.
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    /// The receiving endpoint's mailbox is gone.
    #[error("endpoint stopped")]
    Stopped,
    /// Every attempt timed out.
    #[error("ask timed out after {attempts} attempts")]
    TimedOut { attempts: u32 },
}

// ---------------------------------------------------------------------------
// Worker endpoints
// ---------------------------------------------------------------------------

/// One in-flight command to a worker, paired with its reply slot.
pub struct WorkerCall {
    pub command: WorkerCommand,
    pub reply: oneshot::Sender<WorkerReply>,
}

/// Handle the master uses to reach one worker's command loop.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    tx: mpsc::UnboundedSender<WorkerCall>,
}

impl WorkerEndpoint {
    /// Creates the endpoint and the receiver its worker agent drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// One ask attempt, without timeout handling.
    pub async fn ask(&self, command: WorkerCommand) -> Result<WorkerReply, AskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerCall {
                command,
                reply: reply_tx,
            })
            .map_err(|_| AskError::Stopped)?;
        reply_rx.await.map_err(|_| AskError::Stopped)
    }
}

/// Asks a worker with the configured timeout, retrying timed-out attempts.
pub async fn ask_with_retry(
    endpoint: &WorkerEndpoint,
    command: WorkerCommand,
    timeout: Duration,
    retries: u32,
) -> Result<WorkerReply, AskError> {
    let attempts = retries + 1;
    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, endpoint.ask(command.clone())).await {
            Ok(result) => return result,
            Err(_) => {
                warn!(attempt, attempts, "worker ask timed out");
            }
        }
    }
    Err(AskError::TimedOut { attempts })
}

/// Result future of a fan-out: the successful replies, one per responsive
/// worker.
pub type FanoutHandle = oneshot::Receiver<Vec<WorkerReply>>;

/// Spawns a collector that asks every endpoint and gathers the replies.
/// Unresponsive workers are logged and skipped.
pub fn spawn_fanout(
    endpoints: Vec<(BlockManagerId, WorkerEndpoint)>,
    command: WorkerCommand,
    timeout: Duration,
    retries: u32,
) -> FanoutHandle {
    let (tx, rx) = oneshot::channel();
    let _collector = tokio::spawn(async move {
        let asks = endpoints.into_iter().map(|(worker, endpoint)| {
            let command = command.clone();
            async move {
                match ask_with_retry(&endpoint, command, timeout, retries).await {
                    Ok(reply) => Some(reply),
                    Err(err) => {
                        warn!(worker = %worker, %err, "fan-out ask failed");
                        None
                    }
                }
            }
        });
        let replies: Vec<WorkerReply> = futures_util::future::join_all(asks)
            .await
            .into_iter()
            .flatten()
            .collect();
        let _ = tx.send(replies);
    });
    rx
}

// ---------------------------------------------------------------------------
// Mailbox plumbing
// ---------------------------------------------------------------------------

/// One request into the directory mailbox.
///
/// Registration is its own variant because it carries the live worker
/// endpoint, which the wire-level `Register` payload cannot.
pub enum DirectoryRequest {
    Call {
        msg: MasterMessage,
        reply: oneshot::Sender<MasterReply>,
    },
    Register {
        payload: RegisterPayload,
        endpoint: WorkerEndpoint,
        reply: oneshot::Sender<MasterReply>,
    },
}

/// Reply to one directory request. Fan-outs hand back a future rather than
/// blocking the mailbox on worker round-trips.
pub enum MasterReply {
    Unit,
    Bool(bool),
    Locations(Vec<BlockManagerId>),
    MultiLocations(Vec<Vec<BlockManagerId>>),
    Endpoint(Option<WorkerEndpoint>),
    MemoryStatus(HashMap<BlockManagerId, (u64, u64)>),
    StorageStatus(Vec<StorageStatus>),
    BlockStatusMap(HashMap<BlockManagerId, BlockStatus>),
    BlockIds(Vec<BlockId>),
    Profiles(ProfileBundle),
    Fanout(FanoutHandle),
}

async fn run_directory(
    mut directory: MasterDirectory,
    mut requests: mpsc::Receiver<DirectoryRequest>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            DirectoryRequest::Register {
                payload,
                endpoint,
                reply,
            } => {
                directory.register(payload.worker, payload.max_mem_bytes, endpoint);
                let _ = reply.send(MasterReply::Unit);
            }
            DirectoryRequest::Call { msg, reply } => {
                let stopping = matches!(msg, MasterMessage::Stop);
                let out = directory.handle(msg);
                let _ = reply.send(out);
                if stopping {
                    break;
                }
            }
        }
    }
    info!("master mailbox drained");
}

// ---------------------------------------------------------------------------
// MasterHandle
// ---------------------------------------------------------------------------

/// Cloneable client handle to the directory mailbox.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<DirectoryRequest>,
    ask_timeout: Duration,
    ask_retries: u32,
}

/// Panics on a reply variant the call can never produce; reaching this is a
/// protocol bug, not an I/O failure.
macro_rules! expect_reply {
    ($reply:expr, $pattern:pat => $out:expr, $what:literal) => {
        match $reply {
            $pattern => $out,
            _ => panic!(concat!("master returned a mismatched reply to ", $what)),
        }
    };
}

impl MasterHandle {
    async fn call(&self, msg: MasterMessage) -> Result<MasterReply, AskError> {
        let attempts = self.ask_retries + 1;
        for attempt in 1..=attempts {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(DirectoryRequest::Call {
                    msg: msg.clone(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| AskError::Stopped)?;
            match tokio::time::timeout(self.ask_timeout, reply_rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(AskError::Stopped),
                Err(_) => warn!(attempt, attempts, "master ask timed out"),
            }
        }
        Err(AskError::TimedOut { attempts })
    }

    /// Registers a worker together with its command endpoint.
    pub async fn register(
        &self,
        worker: BlockManagerId,
        max_mem_bytes: u64,
        endpoint: WorkerEndpoint,
    ) -> Result<(), AskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DirectoryRequest::Register {
                payload: RegisterPayload {
                    worker,
                    max_mem_bytes,
                },
                endpoint,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AskError::Stopped)?;
        reply_rx.await.map_err(|_| AskError::Stopped)?;
        Ok(())
    }

    /// Reports one block's placement. The master answers `false` when it
    /// does not know the worker.
    pub async fn update_block_info(
        &self,
        payload: UpdateBlockInfoPayload,
    ) -> Result<bool, AskError> {
        let reply = self.call(MasterMessage::UpdateBlockInfo(payload)).await?;
        Ok(expect_reply!(reply, MasterReply::Bool(ok) => ok, "UpdateBlockInfo"))
    }

    pub async fn heartbeat(&self, worker: BlockManagerId) -> Result<bool, AskError> {
        let reply = self.call(MasterMessage::Heartbeat { worker }).await?;
        Ok(expect_reply!(reply, MasterReply::Bool(known) => known, "Heartbeat"))
    }

    pub async fn get_locations(&self, block: BlockId) -> Result<Vec<BlockManagerId>, AskError> {
        let reply = self.call(MasterMessage::GetLocations { block }).await?;
        Ok(expect_reply!(reply, MasterReply::Locations(l) => l, "GetLocations"))
    }

    pub async fn get_locations_multiple(
        &self,
        blocks: Vec<BlockId>,
    ) -> Result<Vec<Vec<BlockManagerId>>, AskError> {
        let reply = self
            .call(MasterMessage::GetLocationsMultiple { blocks })
            .await?;
        Ok(expect_reply!(reply, MasterReply::MultiLocations(l) => l, "GetLocationsMultiple"))
    }

    pub async fn get_peers(&self, worker: BlockManagerId) -> Result<Vec<BlockManagerId>, AskError> {
        let reply = self.call(MasterMessage::GetPeers { worker }).await?;
        Ok(expect_reply!(reply, MasterReply::Locations(l) => l, "GetPeers"))
    }

    pub async fn get_executor_endpoint(
        &self,
        executor_id: String,
    ) -> Result<Option<WorkerEndpoint>, AskError> {
        let reply = self
            .call(MasterMessage::GetExecutorEndpoint { executor_id })
            .await?;
        Ok(expect_reply!(reply, MasterReply::Endpoint(e) => e, "GetExecutorEndpoint"))
    }

    pub async fn get_memory_status(
        &self,
    ) -> Result<HashMap<BlockManagerId, (u64, u64)>, AskError> {
        let reply = self.call(MasterMessage::GetMemoryStatus).await?;
        Ok(expect_reply!(reply, MasterReply::MemoryStatus(m) => m, "GetMemoryStatus"))
    }

    pub async fn get_storage_status(&self) -> Result<Vec<StorageStatus>, AskError> {
        let reply = self.call(MasterMessage::GetStorageStatus).await?;
        Ok(expect_reply!(reply, MasterReply::StorageStatus(s) => s, "GetStorageStatus"))
    }

    pub async fn get_block_status(
        &self,
        block: BlockId,
    ) -> Result<HashMap<BlockManagerId, BlockStatus>, AskError> {
        let reply = self
            .call(MasterMessage::GetBlockStatus {
                block,
                ask_workers: false,
            })
            .await?;
        Ok(expect_reply!(reply, MasterReply::BlockStatusMap(m) => m, "GetBlockStatus"))
    }

    pub async fn get_matching_block_ids(
        &self,
        filter: BlockIdFilter,
    ) -> Result<Vec<BlockId>, AskError> {
        let reply = self
            .call(MasterMessage::GetMatchingBlockIds {
                filter,
                ask_workers: false,
            })
            .await?;
        Ok(expect_reply!(reply, MasterReply::BlockIds(ids) => ids, "GetMatchingBlockIds"))
    }

    pub async fn has_cached_blocks(&self, executor_id: String) -> Result<bool, AskError> {
        let reply = self
            .call(MasterMessage::HasCachedBlocks { executor_id })
            .await?;
        Ok(expect_reply!(reply, MasterReply::Bool(b) => b, "HasCachedBlocks"))
    }

    pub async fn report_cache_hit(
        &self,
        worker: BlockManagerId,
        deltas: [u64; 4],
    ) -> Result<(), AskError> {
        self.call(MasterMessage::ReportCacheHit { worker, deltas })
            .await?;
        Ok(())
    }

    pub async fn get_ref_profile(
        &self,
        worker: BlockManagerId,
    ) -> Result<ProfileBundle, AskError> {
        let reply = self.call(MasterMessage::GetRefProfile { worker }).await?;
        Ok(expect_reply!(reply, MasterReply::Profiles(p) => p, "GetRefProfile"))
    }

    pub async fn block_with_peer_evicted(&self, block: BlockId) -> Result<(), AskError> {
        self.call(MasterMessage::BlockWithPeerEvicted { block })
            .await?;
        Ok(())
    }

    async fn fanout_call(&self, msg: MasterMessage, what: &str) -> Result<Vec<WorkerReply>, AskError> {
        let reply = self.call(msg).await?;
        let MasterReply::Fanout(handle) = reply else {
            panic!("master returned a mismatched reply to {what}");
        };
        handle.await.map_err(|_| AskError::Stopped)
    }

    /// Removes a dataset everywhere; resolves to the per-worker removal
    /// counts once every responsive worker has answered.
    pub async fn remove_dataset(&self, dataset_id: u64) -> Result<Vec<WorkerReply>, AskError> {
        self.fanout_call(MasterMessage::RemoveDataset { dataset_id }, "RemoveDataset")
            .await
    }

    pub async fn remove_shuffle(&self, shuffle_id: u64) -> Result<Vec<WorkerReply>, AskError> {
        self.fanout_call(MasterMessage::RemoveShuffle { shuffle_id }, "RemoveShuffle")
            .await
    }

    pub async fn remove_broadcast(
        &self,
        broadcast_id: u64,
        from_driver: bool,
    ) -> Result<Vec<WorkerReply>, AskError> {
        self.fanout_call(
            MasterMessage::RemoveBroadcast {
                broadcast_id,
                from_driver,
            },
            "RemoveBroadcast",
        )
        .await
    }

    pub async fn start_broadcast_job_id(&self, job: u64) -> Result<Vec<WorkerReply>, AskError> {
        self.fanout_call(MasterMessage::StartBroadcastJobId { job }, "StartBroadcastJobId")
            .await
    }

    pub async fn start_broadcast_ref_count(
        &self,
        job: u64,
        partitions: u32,
        refs: HashMap<u64, i64>,
    ) -> Result<Vec<WorkerReply>, AskError> {
        self.fanout_call(
            MasterMessage::StartBroadcastRefCount {
                job,
                partitions,
                refs,
            },
            "StartBroadcastRefCount",
        )
        .await
    }

    pub async fn start_broadcast_dag_info(
        &self,
        job: u64,
        partitions: u32,
        dag: blockgrid_core::DagInfo,
        access_number: u64,
    ) -> Result<Vec<WorkerReply>, AskError> {
        self.fanout_call(
            MasterMessage::StartBroadcastDagInfo {
                job,
                partitions,
                dag,
                access_number,
            },
            "StartBroadcastDagInfo",
        )
        .await
    }

    pub async fn remove_executor(&self, executor_id: String) -> Result<(), AskError> {
        self.call(MasterMessage::RemoveExecutor { executor_id })
            .await?;
        Ok(())
    }

    /// Stops the master, flushing telemetry first.
    pub async fn stop(&self) -> Result<(), AskError> {
        self.call(MasterMessage::Stop).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Master
// ---------------------------------------------------------------------------

/// A running master directory: the client handle, the membership event
/// stream, and the mailbox task.
pub struct Master {
    pub handle: MasterHandle,
    pub events: mpsc::UnboundedReceiver<DirectoryEvent>,
    pub task: JoinHandle<()>,
}

/// Loads profiles and spawns the directory mailbox task.
pub fn spawn_master(config: MasterConfig) -> anyhow::Result<Master> {
    let profiles = load_profiles(&config.profile_dir, &config.app_name)?;
    let telemetry = std::sync::Arc::new(TelemetryBundle::default());
    let (request_tx, request_rx) = mpsc::channel(128);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let handle = MasterHandle {
        tx: request_tx,
        ask_timeout: config.ask_timeout,
        ask_retries: config.ask_retries,
    };
    let directory = MasterDirectory::new(config, profiles, telemetry, event_tx);
    let task = tokio::spawn(run_directory(directory, request_rx));

    debug!("master directory spawned");
    Ok(Master {
        handle,
        events: event_rx,
        task,
    })
}
