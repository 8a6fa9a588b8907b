//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::snapshot::SnapshotStatus;

/// Errors surfaced by the log, snapshot and metadata stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("CRC mismatch at offset {offset}: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("corrupt segment header in {path}")]
    CorruptHeader { path: PathBuf },

    #[error("appended index {index} does not follow last index {last}")]
    IndexGap { index: u64, last: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("snapshot {id} at index {index} is {actual:?}, expected {expected:?}")]
    SnapshotState {
        id: u64,
        index: u64,
        actual: SnapshotStatus,
        expected: SnapshotStatus,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;
