//! Worker (block manager) identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Executor id reserved for the driver process.
pub const DRIVER_EXECUTOR_ID: &str = "driver";

/// Identifies one worker process holding cached blocks.
///
/// Equality covers all three fields; the directory additionally indexes
/// workers by bare `executor_id` so a restarted executor replaces its
/// predecessor on registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockManagerId {
    pub executor_id: String,
    pub host: String,
    pub port: u16,
}

impl BlockManagerId {
    #[must_use]
    pub fn new(executor_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            executor_id: executor_id.into(),
            host: host.into(),
            port,
        }
    }

    /// `true` when this id names the driver rather than an executor.
    #[must_use]
    pub fn is_driver(&self) -> bool {
        self.executor_id == DRIVER_EXECUTOR_ID
    }
}

impl fmt::Display for BlockManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.executor_id, self.host, self.port)
    }
}
