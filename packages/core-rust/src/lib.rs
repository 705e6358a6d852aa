//! `BlockGrid` Core -- identifiers, storage levels, reference profiles, and
//! message schemas.
//!
//! This crate provides the foundation layer for the `BlockGrid` cache:
//!
//! - **Block** ([`block`]): `BlockId` discriminators and textual round-trip
//! - **Level** ([`level`]): `StorageLevel`, `MemoryMode`, `BlockStatus`
//! - **Worker** ([`worker`]): `BlockManagerId` worker identity
//! - **Value** ([`value`]): tagged runtime `Value` with size estimation
//! - **Profile** ([`profile`]): reference/peer/DAG profiles and their
//!   plain-text file parsers
//! - **Messages** ([`messages`]): worker/master wire schemas and the binary
//!   `UpdateBlockInfo` codec

pub mod block;
pub mod level;
pub mod messages;
pub mod profile;
pub mod value;
pub mod worker;

// Block identifiers
pub use block::{BlockId, BlockIdFilter, BlockIdParseError, DatasetId, JobId, TaskId};

// Levels and status
pub use level::{BlockStatus, MemoryMode, StorageLevel};

// Worker identity
pub use worker::{BlockManagerId, DRIVER_EXECUTOR_ID};

// Values
pub use value::{estimated_slice_size, Value};

// Profiles
pub use profile::{
    parse_job_dag, parse_peers, parse_ref_profile, profile_file_names, DagInfo, ProfileBundle,
    ProfileParseError, ReuseHistogram,
};
