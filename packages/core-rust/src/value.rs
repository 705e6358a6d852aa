//! Runtime value type for deserialized block contents.
//!
//! Cached blocks are sequences of [`Value`]s; the enum tag plays the role a
//! class tag would in a generics-based design. Sizes reported to the memory
//! account come from [`Value::estimated_size`], a shallow heap estimate that
//! only needs to be consistent, not exact.

use serde::{Deserialize, Serialize};

/// Per-value bookkeeping overhead assumed by the size estimate (tag plus
/// payload slot plus allocator slack).
const VALUE_OVERHEAD: u64 = 16;

/// One element of a deserialized block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    /// Estimated in-memory footprint in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        match self {
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) => VALUE_OVERHEAD,
            Self::Text(s) => VALUE_OVERHEAD + s.len() as u64,
            Self::Bytes(b) => VALUE_OVERHEAD + b.len() as u64,
            Self::Array(items) => {
                VALUE_OVERHEAD + items.iter().map(Value::estimated_size).sum::<u64>()
            }
        }
    }
}

/// Estimated footprint of a slice of values.
#[must_use]
pub fn estimated_slice_size(values: &[Value]) -> u64 {
    values.iter().map(Value::estimated_size).sum()
}
