//! Wire message schemas exchanged between workers and the master directory.
//!
//! Transport is external to this crate: the enums here define payloads only
//! and serialize with `rmp_serde::to_vec_named()` when they cross a process
//! boundary. [`master`] carries worker-to-master requests, [`worker`] carries
//! master-to-worker commands, and [`codec`] holds the fixed binary frame for
//! `UpdateBlockInfo`.

pub mod codec;
pub mod master;
pub mod worker;

pub use codec::{decode_update_block_info, encode_update_block_info, CodecError};
pub use master::{MasterMessage, RegisterPayload, UpdateBlockInfoPayload};
pub use worker::{WorkerCommand, WorkerReply};
