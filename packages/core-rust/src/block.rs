//! Block and dataset identifiers.
//!
//! A block is one cached unit: a partition of a dataset, one slice of a
//! shuffle, a broadcast payload, or a scratch buffer. Block ids round-trip
//! through their textual name (`dataset_4_2`, `shuffle_1_0_3`, `broadcast_7`,
//! ...), which is also the form embedded in the binary `UpdateBlockInfo`
//! frame. Only dataset blocks participate in reference-count and lease
//! accounting; the other discriminators exist so the directory can track and
//! remove them wholesale.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Identifies a logical dataset whose partitions share profile statistics.
pub type DatasetId = u64;

/// Identifies a job submitted to the compute engine.
pub type JobId = u64;

/// Identifies a task attempt running on a worker.
pub type TaskId = u64;

// ---------------------------------------------------------------------------
// BlockId
// ---------------------------------------------------------------------------

/// Identifier of a single cached block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BlockId {
    /// One partition of a dataset. The only kind that carries reference
    /// counts and leases.
    Dataset { dataset_id: DatasetId, partition: u32 },
    /// Intermediate shuffle output.
    Shuffle {
        shuffle_id: u64,
        map_id: u64,
        reduce_id: u64,
    },
    /// A broadcast payload replicated to every worker.
    Broadcast { broadcast_id: u64 },
    /// Scratch block with a caller-chosen name.
    Temp { name: String },
    /// Block used only by test harnesses.
    Test { name: String },
}

impl BlockId {
    /// Convenience constructor for a dataset block.
    #[must_use]
    pub fn dataset(dataset_id: DatasetId, partition: u32) -> Self {
        Self::Dataset {
            dataset_id,
            partition,
        }
    }

    /// `true` for dataset blocks, the only kind subject to ref/lease logic.
    #[must_use]
    pub fn is_dataset(&self) -> bool {
        matches!(self, Self::Dataset { .. })
    }

    /// The dataset this block belongs to, if it is a dataset block.
    #[must_use]
    pub fn dataset_id(&self) -> Option<DatasetId> {
        match self {
            Self::Dataset { dataset_id, .. } => Some(*dataset_id),
            _ => None,
        }
    }

    /// `true` for broadcast blocks.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast { .. })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset {
                dataset_id,
                partition,
            } => write!(f, "dataset_{dataset_id}_{partition}"),
            Self::Shuffle {
                shuffle_id,
                map_id,
                reduce_id,
            } => write!(f, "shuffle_{shuffle_id}_{map_id}_{reduce_id}"),
            Self::Broadcast { broadcast_id } => write!(f, "broadcast_{broadcast_id}"),
            Self::Temp { name } => write!(f, "temp_{name}"),
            Self::Test { name } => write!(f, "test_{name}"),
        }
    }
}

/// Error produced when a textual block name does not match any known form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized block name: {0:?}")]
pub struct BlockIdParseError(pub String);

fn dataset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^dataset_(\d+)_(\d+)$").expect("static pattern"))
}

fn shuffle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^shuffle_(\d+)_(\d+)_(\d+)$").expect("static pattern"))
}

fn broadcast_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^broadcast_(\d+)$").expect("static pattern"))
}

impl FromStr for BlockId {
    type Err = BlockIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_u64 = |m: &str| m.parse::<u64>().map_err(|_| BlockIdParseError(s.to_string()));

        if let Some(caps) = dataset_re().captures(s) {
            return Ok(Self::Dataset {
                dataset_id: parse_u64(&caps[1])?,
                partition: caps[2]
                    .parse()
                    .map_err(|_| BlockIdParseError(s.to_string()))?,
            });
        }
        if let Some(caps) = shuffle_re().captures(s) {
            return Ok(Self::Shuffle {
                shuffle_id: parse_u64(&caps[1])?,
                map_id: parse_u64(&caps[2])?,
                reduce_id: parse_u64(&caps[3])?,
            });
        }
        if let Some(caps) = broadcast_re().captures(s) {
            return Ok(Self::Broadcast {
                broadcast_id: parse_u64(&caps[1])?,
            });
        }
        if let Some(name) = s.strip_prefix("temp_") {
            return Ok(Self::Temp {
                name: name.to_string(),
            });
        }
        if let Some(name) = s.strip_prefix("test_") {
            return Ok(Self::Test {
                name: name.to_string(),
            });
        }
        Err(BlockIdParseError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// BlockIdFilter
// ---------------------------------------------------------------------------

/// Serializable predicate over block ids, used where a closure cannot cross
/// the wire (`GetMatchingBlockIds`, bulk removal commands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BlockIdFilter {
    /// Matches every block.
    Any,
    /// Matches every block of one dataset.
    Dataset { dataset_id: DatasetId },
    /// Matches every slice of one shuffle.
    Shuffle { shuffle_id: u64 },
    /// Matches one broadcast payload.
    Broadcast { broadcast_id: u64 },
}

impl BlockIdFilter {
    /// Applies the filter to a block id.
    #[must_use]
    pub fn matches(&self, block: &BlockId) -> bool {
        match (self, block) {
            (Self::Any, _) => true,
            (Self::Dataset { dataset_id }, BlockId::Dataset { dataset_id: d, .. }) => {
                dataset_id == d
            }
            (Self::Shuffle { shuffle_id }, BlockId::Shuffle { shuffle_id: s, .. }) => {
                shuffle_id == s
            }
            (Self::Broadcast { broadcast_id }, BlockId::Broadcast { broadcast_id: b }) => {
                broadcast_id == b
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
