//! keel-storage: durable state for the keel replication core.
//!
//! Three stores, one directory each:
//! - [`SegmentedLog`]: the replicated entry log, split into CRC-validated
//!   segment files with a single locked writer and lock-free readers.
//! - [`SnapshotStore`]: staged snapshots keyed by `(id, index)` with an
//!   atomic publish step.
//! - [`MetaStore`]: the `(current_term, voted_for)` pair, replaced
//!   atomically via temp-file rename.

pub mod entry;
pub mod error;
pub mod log;
pub mod meta;
mod segment;
pub mod snapshot;

pub use entry::{decode_record, encode_record, Entry, IndexedEntry, LogIndex, Term};
pub use error::{Result, StorageError};
pub use log::{LogConfig, LogCursor, LogReader, LogWriter, LogWriterGuard, RecoveryInfo, SegmentedLog};
pub use meta::{MetaStore, Metadata};
pub use snapshot::{Snapshot, SnapshotStatus, SnapshotStore, SnapshotWriter};
