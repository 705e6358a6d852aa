//! Master directory: the coordinator that tracks block locations and
//! distributes reference profiles.

pub mod directory;
pub mod endpoint;
pub mod profiles;
pub mod telemetry;

pub use directory::{DirectoryEvent, MasterDirectory, StorageStatus, WorkerInfo};
pub use endpoint::{
    ask_with_retry, spawn_fanout, spawn_master, AskError, DirectoryRequest, FanoutHandle, Master,
    MasterHandle, MasterReply, WorkerCall, WorkerEndpoint,
};
pub use profiles::load_profiles;
pub use telemetry::{append_summary, TelemetryBundle, TelemetrySnapshot};
