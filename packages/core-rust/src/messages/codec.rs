//! Fixed binary frame for `UpdateBlockInfo`.
//!
//! Layout, in order: block-manager id (executor id, host as length-prefixed
//! UTF-8, port as u16), the UTF-8 name of the block id, the storage level
//! (flag byte plus replication byte), then mem-size and disk-size as
//! big-endian i64. Strings are prefixed with a u16 byte length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::level::StorageLevel;
use crate::messages::master::UpdateBlockInfoPayload;
use crate::worker::BlockManagerId;

const LEVEL_USE_MEMORY: u8 = 1;
const LEVEL_USE_DISK: u8 = 1 << 1;
const LEVEL_USE_OFF_HEAP: u8 = 1 << 2;
const LEVEL_DESERIALIZED: u8 = 1 << 3;

/// Error decoding a binary `UpdateBlockInfo` frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated while reading {context}")]
    Truncated { context: &'static str },
    #[error("frame field {context} is not valid UTF-8")]
    InvalidUtf8 { context: &'static str },
    #[error("frame carries an unparseable block name")]
    BadBlockName(#[from] crate::block::BlockIdParseError),
    #[error("negative size field {context}")]
    NegativeSize { context: &'static str },
}

fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= usize::from(u16::MAX));
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes, context: &'static str) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated { context });
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(CodecError::Truncated { context });
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { context })
}

fn level_flags(level: &StorageLevel) -> u8 {
    let mut flags = 0;
    if level.use_memory {
        flags |= LEVEL_USE_MEMORY;
    }
    if level.use_disk {
        flags |= LEVEL_USE_DISK;
    }
    if level.use_off_heap {
        flags |= LEVEL_USE_OFF_HEAP;
    }
    if level.deserialized {
        flags |= LEVEL_DESERIALIZED;
    }
    flags
}

/// Encodes one `UpdateBlockInfo` payload into its binary frame.
#[must_use]
pub fn encode_update_block_info(payload: &UpdateBlockInfoPayload) -> Bytes {
    let mut buf = BytesMut::new();
    put_str(&mut buf, &payload.worker.executor_id);
    put_str(&mut buf, &payload.worker.host);
    buf.put_u16(payload.worker.port);
    put_str(&mut buf, &payload.block.to_string());
    buf.put_u8(level_flags(&payload.storage_level));
    debug_assert!(payload.storage_level.replication <= u32::from(u8::MAX));
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u8(payload.storage_level.replication as u8);
    buf.put_i64(i64::try_from(payload.mem_size).unwrap_or(i64::MAX));
    buf.put_i64(i64::try_from(payload.disk_size).unwrap_or(i64::MAX));
    buf.freeze()
}

/// Decodes a binary frame produced by [`encode_update_block_info`].
pub fn decode_update_block_info(frame: Bytes) -> Result<UpdateBlockInfoPayload, CodecError> {
    let mut buf = frame;

    let executor_id = get_str(&mut buf, "executor id")?;
    let host = get_str(&mut buf, "host")?;
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated { context: "port" });
    }
    let port = buf.get_u16();

    let block_name = get_str(&mut buf, "block name")?;
    let block = block_name.parse()?;

    if buf.remaining() < 2 {
        return Err(CodecError::Truncated {
            context: "storage level",
        });
    }
    let flags = buf.get_u8();
    let replication = u32::from(buf.get_u8());
    let storage_level = StorageLevel::new(
        flags & LEVEL_USE_MEMORY != 0,
        flags & LEVEL_USE_DISK != 0,
        flags & LEVEL_USE_OFF_HEAP != 0,
        flags & LEVEL_DESERIALIZED != 0,
        replication,
    );

    if buf.remaining() < 16 {
        return Err(CodecError::Truncated { context: "sizes" });
    }
    let mem_size = buf.get_i64();
    let disk_size = buf.get_i64();
    let mem_size = u64::try_from(mem_size).map_err(|_| CodecError::NegativeSize {
        context: "mem size",
    })?;
    let disk_size = u64::try_from(disk_size).map_err(|_| CodecError::NegativeSize {
        context: "disk size",
    })?;

    Ok(UpdateBlockInfoPayload {
        worker: BlockManagerId::new(executor_id, host, port),
        block,
        storage_level,
        mem_size,
        disk_size,
    })
}
