//! Cached entry representations.
//!
//! A block lives in memory either as a deserialized value array or as a
//! chunked byte buffer; the two forms are mutually exclusive. Chunking keeps
//! serialized blocks out of single giant allocations and lets readers share
//! the underlying chunks without copying (`bytes::Bytes` is reference
//! counted).

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use blockgrid_core::{MemoryMode, Value};

// ---------------------------------------------------------------------------
// ChunkedByteBuffer
// ---------------------------------------------------------------------------

/// Immutable serialized block contents, split into fixed-size chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkedByteBuffer {
    chunks: Vec<Bytes>,
}

impl ChunkedByteBuffer {
    /// Wraps a single contiguous allocation as a one-chunk buffer.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            chunks: vec![Bytes::from(data)],
        }
    }

    /// Total byte size across all chunks.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The underlying chunks, cheap to clone individually.
    #[must_use]
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Copies all chunks into one contiguous vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(usize::try_from(self.size()).unwrap_or(0));
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ChunkedBufferWriter
// ---------------------------------------------------------------------------

/// `io::Write` sink that accumulates bytes into fixed-size chunks.
///
/// Used by the serializing put path: elements are encoded straight into the
/// writer and the running [`bytes_written`](Self::bytes_written) count drives
/// unroll-memory threshold checks.
#[derive(Debug)]
pub struct ChunkedBufferWriter {
    chunk_size: usize,
    chunks: Vec<Bytes>,
    current: BytesMut,
    written: u64,
}

impl ChunkedBufferWriter {
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            chunk_size,
            chunks: Vec::new(),
            current: BytesMut::new(),
            written: 0,
        }
    }

    /// Bytes accepted so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Seals the writer into an immutable buffer.
    #[must_use]
    pub fn finish(mut self) -> ChunkedByteBuffer {
        if !self.current.is_empty() {
            self.chunks.push(self.current.freeze());
        }
        ChunkedByteBuffer {
            chunks: self.chunks,
        }
    }
}

impl io::Write for ChunkedBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.chunk_size - self.current.len();
            if room == 0 {
                self.chunks.push(self.current.split().freeze());
                continue;
            }
            let take = room.min(rest.len());
            self.current.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One cached block.
///
/// The variant is fixed for the entry's lifetime; replacing the form means
/// replacing the whole entry. Deserialized entries always live on-heap.
#[derive(Debug, Clone)]
pub enum Entry {
    Deserialized {
        values: Arc<Vec<Value>>,
        size: u64,
    },
    Serialized {
        buffer: ChunkedByteBuffer,
        mode: MemoryMode,
    },
}

impl Entry {
    /// Byte size charged against the memory account.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Deserialized { size, .. } => *size,
            Self::Serialized { buffer, .. } => buffer.size(),
        }
    }

    /// Memory region the entry occupies.
    #[must_use]
    pub fn mode(&self) -> MemoryMode {
        match self {
            Self::Deserialized { .. } => MemoryMode::OnHeap,
            Self::Serialized { mode, .. } => *mode,
        }
    }
}
