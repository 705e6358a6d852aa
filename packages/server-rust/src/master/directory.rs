//! Master directory state and message handling.
//!
//! The directory owns plain maps because the endpoint processes one message
//! to completion at a time (see [`endpoint`](super::endpoint)); the only
//! concurrency it touches is spawning fan-out collector tasks, whose results
//! callers await outside the mailbox.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use blockgrid_core::messages::master::{MasterMessage, UpdateBlockInfoPayload};
use blockgrid_core::messages::worker::WorkerCommand;
use blockgrid_core::{BlockId, BlockIdFilter, BlockManagerId, BlockStatus, ProfileBundle};

use crate::config::MasterConfig;

use super::endpoint::{MasterReply, WorkerEndpoint};
use super::telemetry::{append_summary, TelemetryBundle};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Everything the master knows about one registered worker.
pub struct WorkerInfo {
    pub id: BlockManagerId,
    pub max_mem_bytes: u64,
    pub remaining_mem_bytes: u64,
    pub last_seen: Instant,
    pub blocks: HashMap<BlockId, BlockStatus>,
    pub cached_blocks: HashSet<BlockId>,
    pub endpoint: WorkerEndpoint,
}

/// Per-worker storage report returned by `GetStorageStatus`.
#[derive(Debug, Clone)]
pub struct StorageStatus {
    pub worker: BlockManagerId,
    pub max_mem_bytes: u64,
    pub remaining_mem_bytes: u64,
    pub blocks: HashMap<BlockId, BlockStatus>,
}

/// Reactive notifications emitted on membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    WorkerAdded {
        worker: BlockManagerId,
        max_mem_bytes: u64,
    },
    WorkerRemoved {
        worker: BlockManagerId,
    },
}

// ---------------------------------------------------------------------------
// MasterDirectory
// ---------------------------------------------------------------------------

/// Coordinator state: worker registry, block locations, profiles, telemetry.
pub struct MasterDirectory {
    config: MasterConfig,
    workers: HashMap<BlockManagerId, WorkerInfo>,
    worker_by_executor: HashMap<String, BlockManagerId>,
    block_locations: HashMap<BlockId, HashSet<BlockManagerId>>,
    profiles: ProfileBundle,
    telemetry: std::sync::Arc<TelemetryBundle>,
    events: tokio::sync::mpsc::UnboundedSender<DirectoryEvent>,
    peer_event_seq: u64,
    total_reference: i64,
    started_at: Instant,
}

impl MasterDirectory {
    #[must_use]
    pub fn new(
        config: MasterConfig,
        profiles: ProfileBundle,
        telemetry: std::sync::Arc<TelemetryBundle>,
        events: tokio::sync::mpsc::UnboundedSender<DirectoryEvent>,
    ) -> Self {
        Self {
            config,
            workers: HashMap::new(),
            worker_by_executor: HashMap::new(),
            block_locations: HashMap::new(),
            profiles,
            telemetry,
            events,
            peer_event_seq: 0,
            total_reference: 0,
            started_at: Instant::now(),
        }
    }

    // -- Registration --------------------------------------------------------

    /// Registers a worker, dropping any previous registration with the same
    /// executor id first.
    pub fn register(&mut self, worker: BlockManagerId, max_mem_bytes: u64, endpoint: WorkerEndpoint) {
        if let Some(old) = self.worker_by_executor.get(&worker.executor_id).cloned() {
            if old != worker {
                info!(old = %old, new = %worker, "executor re-registered, dropping stale worker");
            }
            self.remove_worker(&old);
        }

        info!(worker = %worker, max_mem_bytes, "worker registered");
        self.worker_by_executor
            .insert(worker.executor_id.clone(), worker.clone());
        self.workers.insert(
            worker.clone(),
            WorkerInfo {
                id: worker.clone(),
                max_mem_bytes,
                remaining_mem_bytes: max_mem_bytes,
                last_seen: Instant::now(),
                blocks: HashMap::new(),
                cached_blocks: HashSet::new(),
                endpoint,
            },
        );
        let _ = self.events.send(DirectoryEvent::WorkerAdded {
            worker,
            max_mem_bytes,
        });
    }

    fn remove_worker(&mut self, worker: &BlockManagerId) {
        let Some(info) = self.workers.remove(worker) else {
            return;
        };
        if self.worker_by_executor.get(&worker.executor_id) == Some(worker) {
            self.worker_by_executor.remove(&worker.executor_id);
        }
        for block in info.blocks.keys() {
            if let Some(locations) = self.block_locations.get_mut(block) {
                locations.remove(worker);
                if locations.is_empty() {
                    self.block_locations.remove(block);
                }
            }
        }
        info!(worker = %worker, "worker removed");
        let _ = self.events.send(DirectoryEvent::WorkerRemoved {
            worker: worker.clone(),
        });
    }

    // -- Placement -----------------------------------------------------------

    /// Merges one block report. Returns `false` for unregistered workers
    /// (the driver is tolerated and simply ignored).
    pub fn update_block_info(&mut self, payload: &UpdateBlockInfoPayload) -> bool {
        let Some(info) = self.workers.get_mut(&payload.worker) else {
            return payload.worker.is_driver();
        };
        info.last_seen = Instant::now();

        let old_mem = info
            .blocks
            .get(&payload.block)
            .map_or(0, |status| status.mem_size);

        if payload.storage_level.is_valid() {
            let status = BlockStatus {
                storage_level: payload.storage_level,
                mem_size: payload.mem_size,
                disk_size: payload.disk_size,
            };
            info.remaining_mem_bytes = info
                .remaining_mem_bytes
                .saturating_add(old_mem)
                .saturating_sub(payload.mem_size);
            info.blocks.insert(payload.block.clone(), status);
            if status.is_cached() {
                info.cached_blocks.insert(payload.block.clone());
            } else {
                info.cached_blocks.remove(&payload.block);
            }
            self.block_locations
                .entry(payload.block.clone())
                .or_default()
                .insert(payload.worker.clone());
            debug!(worker = %payload.worker, block = %payload.block,
                mem = payload.mem_size, disk = payload.disk_size, "updated block info");
        } else {
            info.blocks.remove(&payload.block);
            info.cached_blocks.remove(&payload.block);
            info.remaining_mem_bytes = info.remaining_mem_bytes.saturating_add(old_mem);
            if let Some(locations) = self.block_locations.get_mut(&payload.block) {
                locations.remove(&payload.worker);
                if locations.is_empty() {
                    self.block_locations.remove(&payload.block);
                }
            }
            debug!(worker = %payload.worker, block = %payload.block, "block left worker");
        }
        true
    }

    // -- Reads ---------------------------------------------------------------

    fn locations(&self, block: &BlockId) -> Vec<BlockManagerId> {
        self.block_locations
            .get(block)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn peers_of(&self, worker: &BlockManagerId) -> Vec<BlockManagerId> {
        self.workers
            .keys()
            .filter(|id| *id != worker && !id.is_driver())
            .cloned()
            .collect()
    }

    fn block_status(&self, block: &BlockId) -> HashMap<BlockManagerId, BlockStatus> {
        self.workers
            .iter()
            .filter_map(|(id, info)| {
                info.blocks.get(block).map(|status| (id.clone(), *status))
            })
            .collect()
    }

    fn matching_block_ids(&self, filter: &BlockIdFilter) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .block_locations
            .keys()
            .filter(|block| filter.matches(block))
            .cloned()
            .collect();
        ids.sort_by_key(ToString::to_string);
        ids
    }

    fn has_cached_blocks(&self, executor_id: &str) -> bool {
        self.worker_by_executor
            .get(executor_id)
            .and_then(|id| self.workers.get(id))
            .is_some_and(|info| !info.cached_blocks.is_empty())
    }

    // -- Fan-out helpers -----------------------------------------------------

    fn endpoints(&self) -> Vec<(BlockManagerId, WorkerEndpoint)> {
        self.workers
            .iter()
            .map(|(id, info)| (id.clone(), info.endpoint.clone()))
            .collect()
    }

    fn fan_out(&self, command: WorkerCommand) -> MasterReply {
        MasterReply::Fanout(super::endpoint::spawn_fanout(
            self.endpoints(),
            command,
            self.config.ask_timeout,
            self.config.ask_retries,
        ))
    }

    /// Purges the master's own metadata for every block of a dataset.
    fn purge_dataset_metadata(&mut self, dataset_id: u64) {
        let filter = BlockIdFilter::Dataset { dataset_id };
        let blocks: Vec<BlockId> = self
            .block_locations
            .keys()
            .filter(|block| filter.matches(block))
            .cloned()
            .collect();
        for block in &blocks {
            self.block_locations.remove(block);
            for info in self.workers.values_mut() {
                info.blocks.remove(block);
                info.cached_blocks.remove(block);
            }
        }
        debug!(dataset_id, purged = blocks.len(), "purged dataset metadata");
    }

    // -- Message dispatch ----------------------------------------------------

    /// Handles one directory message. Registration arrives through the
    /// endpoint's dedicated request variant because it carries a live worker
    /// endpoint; a bare wire `Register` is logged and ignored.
    pub fn handle(&mut self, msg: MasterMessage) -> MasterReply {
        match msg {
            MasterMessage::Register(payload) => {
                warn!(worker = %payload.worker, "wire register without endpoint, ignoring");
                MasterReply::Unit
            }
            MasterMessage::UpdateBlockInfo(payload) => {
                MasterReply::Bool(self.update_block_info(&payload))
            }
            MasterMessage::Heartbeat { worker } => {
                let known = match self.workers.get_mut(&worker) {
                    Some(info) => {
                        info.last_seen = Instant::now();
                        true
                    }
                    None => false,
                };
                MasterReply::Bool(known)
            }

            MasterMessage::GetLocations { block } => {
                MasterReply::Locations(self.locations(&block))
            }
            MasterMessage::GetLocationsMultiple { blocks } => MasterReply::MultiLocations(
                blocks.iter().map(|block| self.locations(block)).collect(),
            ),
            MasterMessage::GetPeers { worker } => MasterReply::Locations(self.peers_of(&worker)),
            MasterMessage::GetExecutorEndpoint { executor_id } => MasterReply::Endpoint(
                self.worker_by_executor
                    .get(&executor_id)
                    .and_then(|id| self.workers.get(id))
                    .map(|info| info.endpoint.clone()),
            ),
            MasterMessage::GetMemoryStatus => MasterReply::MemoryStatus(
                self.workers
                    .iter()
                    .map(|(id, info)| {
                        (id.clone(), (info.max_mem_bytes, info.remaining_mem_bytes))
                    })
                    .collect(),
            ),
            MasterMessage::GetStorageStatus => MasterReply::StorageStatus(
                self.workers
                    .values()
                    .map(|info| StorageStatus {
                        worker: info.id.clone(),
                        max_mem_bytes: info.max_mem_bytes,
                        remaining_mem_bytes: info.remaining_mem_bytes,
                        blocks: info.blocks.clone(),
                    })
                    .collect(),
            ),
            MasterMessage::GetBlockStatus { block, .. } => {
                MasterReply::BlockStatusMap(self.block_status(&block))
            }
            MasterMessage::GetMatchingBlockIds { filter, .. } => {
                MasterReply::BlockIds(self.matching_block_ids(&filter))
            }
            MasterMessage::HasCachedBlocks { executor_id } => {
                MasterReply::Bool(self.has_cached_blocks(&executor_id))
            }

            MasterMessage::ReportCacheHit { worker, deltas } => {
                debug!(worker = %worker, ?deltas, "cache report");
                self.telemetry.record(deltas);
                MasterReply::Unit
            }
            MasterMessage::GetRefProfile { worker } => {
                debug!(worker = %worker, "profile fetch");
                MasterReply::Profiles(self.profiles.clone())
            }

            MasterMessage::BlockWithPeerEvicted { block } => {
                let Some(dataset) = block.dataset_id() else {
                    warn!(block = %block, "peer eviction notice for non-dataset block");
                    return MasterReply::Unit;
                };
                if !self.profiles.peer_profile.contains_key(&dataset) {
                    debug!(block = %block, dataset, "evicted block has no peer, ignoring");
                    return MasterReply::Unit;
                }
                self.peer_event_seq += 1;
                let event_id = self.peer_event_seq;
                let endpoints = self.endpoints();
                for command in [
                    WorkerCommand::CheckPeersConservatively {
                        block: block.clone(),
                        event_id,
                    },
                    WorkerCommand::CheckPeersStrictly { block: block.clone(), event_id },
                ] {
                    let _ = super::endpoint::spawn_fanout(
                        endpoints.clone(),
                        command,
                        self.config.ask_timeout,
                        self.config.ask_retries,
                    );
                }
                debug!(block = %block, event_id, "broadcast peer eviction checks");
                MasterReply::Unit
            }

            MasterMessage::StartBroadcastJobId { job } => {
                let refs = self.profiles.ref_profile_by_job.get(&job).cloned();
                self.fan_out(WorkerCommand::BroadcastJobDag { job, refs })
            }
            MasterMessage::StartBroadcastRefCount {
                job,
                partitions,
                refs,
            } => {
                let delta: i64 = refs.values().sum::<i64>() * i64::from(partitions);
                self.total_reference += delta;
                debug!(job, delta, total = self.total_reference, "reference total updated");
                self.fan_out(WorkerCommand::BroadcastJobDag {
                    job,
                    refs: Some(refs),
                })
            }
            MasterMessage::StartBroadcastDagInfo {
                job,
                partitions,
                dag,
                access_number,
            } => {
                debug!(job, partitions, datasets = dag.len(), "DAG broadcast");
                self.fan_out(WorkerCommand::BroadcastDagInfo {
                    job,
                    dag: Some(dag),
                    access_number,
                })
            }

            MasterMessage::RemoveDataset { dataset_id } => {
                self.purge_dataset_metadata(dataset_id);
                self.fan_out(WorkerCommand::RemoveDataset { dataset_id })
            }
            MasterMessage::RemoveShuffle { shuffle_id } => {
                self.fan_out(WorkerCommand::RemoveShuffle { shuffle_id })
            }
            MasterMessage::RemoveBroadcast {
                broadcast_id,
                from_driver,
            } => self.fan_out(WorkerCommand::RemoveBroadcast {
                broadcast_id,
                from_driver,
            }),
            MasterMessage::RemoveExecutor { executor_id } => {
                if let Some(id) = self.worker_by_executor.get(&executor_id).cloned() {
                    self.remove_worker(&id);
                }
                MasterReply::Unit
            }

            MasterMessage::Stop => {
                let snapshot = self.telemetry.snapshot();
                info!(
                    total_reference = self.total_reference,
                    hits = snapshot.hits,
                    misses = snapshot.misses,
                    "master stopping"
                );
                if let Err(err) = append_summary(
                    &self.config.output_dir,
                    &self.config.app_name,
                    self.started_at.elapsed(),
                    snapshot,
                ) {
                    warn!(%err, "failed to write telemetry summary");
                }
                MasterReply::Unit
            }
        }
    }
}
