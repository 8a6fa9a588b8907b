//! The deterministic apply pipeline.
//!
//! Committed entries are fed to the user state machine in strictly
//! increasing index order. The executor is a pure function of that ordered
//! sequence: the only clock the state machine sees is the timestamp the
//! leader inlined into the entry payload.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use keel_storage::LogReader;

use crate::error::{ErrorKind, RaftError, Result};
use crate::types::{Entry, IndexedEntry, LogIndex};

/// Failure raised by the user state machine while applying an operation.
#[derive(Debug, Error)]
pub enum StateMachineError {
    /// The operation referenced a session this machine has not seen.
    #[error("unknown session {session}")]
    UnknownSession { session: u64 },

    /// The command itself failed (bad arguments, rejected transition).
    #[error("command failure: {reason}")]
    CommandFailure { reason: String },

    /// An application-defined failure inside the state machine.
    #[error("application error: {reason}")]
    ApplicationError { reason: String },
}

impl StateMachineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateMachineError::UnknownSession { .. } => ErrorKind::UnknownSession,
            StateMachineError::CommandFailure { .. } => ErrorKind::CommandFailure,
            StateMachineError::ApplicationError { .. } => ErrorKind::ApplicationError,
        }
    }
}

/// The replicated user state machine.
///
/// Implementations must be deterministic: identical sequences of `apply`
/// calls must produce identical state and results on every server. The
/// `timestamp_ms` arguments are inlined by the leader and must be treated as
/// read-only inputs, never compared against a local clock.
pub trait StateMachine: Send + 'static {
    /// Applies a committed command.
    fn apply(
        &mut self,
        index: LogIndex,
        timestamp_ms: u64,
        command: &Bytes,
    ) -> std::result::Result<Bytes, StateMachineError>;

    /// Executes a read-only query against current state.
    fn query(
        &mut self,
        timestamp_ms: u64,
        session: u64,
        sequence: u64,
        query: &Bytes,
    ) -> std::result::Result<Bytes, StateMachineError>;

    /// Serializes the full state for snapshotting.
    fn snapshot(&self) -> std::result::Result<Bytes, StateMachineError>;

    /// Replaces the full state from a snapshot.
    fn restore(&mut self, data: &Bytes) -> std::result::Result<(), StateMachineError>;
}

/// Result of applying one operation, delivered to waiters by entry index.
#[derive(Debug)]
pub struct OperationResult {
    pub index: LogIndex,
    pub event_index: LogIndex,
    pub result: std::result::Result<Bytes, ErrorKind>,
}

/// Applies committed entries in order and tracks `last_applied`.
pub struct StateMachineExecutor {
    machine: Box<dyn StateMachine>,
    last_applied: LogIndex,
    event_index: LogIndex,
    waiters: Vec<(LogIndex, oneshot::Sender<OperationResult>)>,
}

impl StateMachineExecutor {
    pub fn new(machine: Box<dyn StateMachine>) -> Self {
        Self {
            machine,
            last_applied: LogIndex::ZERO,
            event_index: LogIndex::ZERO,
            waiters: Vec::new(),
        }
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Registers a future for the result of the entry at `index`.
    pub fn register_waiter(&mut self, index: LogIndex) -> oneshot::Receiver<OperationResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push((index, tx));
        rx
    }

    /// Applies a single committed entry. Entries must arrive in index order.
    pub fn apply(&mut self, entry: &IndexedEntry) -> OperationResult {
        debug_assert_eq!(
            entry.index,
            self.last_applied.next(),
            "entries must be applied in index order"
        );

        let result = match &entry.entry {
            Entry::Command {
                timestamp_ms,
                bytes,
            } => {
                let applied = self
                    .machine
                    .apply(entry.index, *timestamp_ms, bytes)
                    .map_err(|e| {
                        tracing::debug!(index = %entry.index, error = %e, "command failed");
                        e.kind()
                    });
                self.event_index = entry.index;
                applied
            }
            Entry::Query {
                timestamp_ms,
                session,
                sequence,
                bytes,
            } => self
                .machine
                .query(*timestamp_ms, *session, *sequence, bytes)
                .map_err(|e| e.kind()),
            Entry::Configuration { .. } | Entry::Noop { .. } => Ok(Bytes::new()),
        };

        self.last_applied = entry.index;

        let outcome = OperationResult {
            index: entry.index,
            event_index: self.event_index,
            result,
        };
        self.complete_waiters(&outcome, entry);
        outcome
    }

    fn complete_waiters(&mut self, outcome: &OperationResult, entry: &IndexedEntry) {
        let mut remaining = Vec::with_capacity(self.waiters.len());
        for (index, tx) in self.waiters.drain(..) {
            if index == entry.index {
                let _ = tx.send(OperationResult {
                    index: outcome.index,
                    event_index: outcome.event_index,
                    result: outcome.result.clone(),
                });
            } else if index > entry.index {
                remaining.push((index, tx));
            }
            // Waiters below the applied index were superseded by a log
            // truncation; dropping the sender signals the failure.
        }
        self.waiters = remaining;
    }

    /// Applies every entry in `(last_applied, up_to]` in index order.
    pub fn apply_all(&mut self, reader: &mut LogReader, up_to: LogIndex) -> Result<()> {
        while self.last_applied < up_to {
            let index = self.last_applied.next();
            let entry = reader.get(index)?.ok_or_else(|| RaftError::Internal {
                reason: format!("committed entry {index} missing from log"),
            })?;
            self.apply(&entry);
        }
        Ok(())
    }

    /// Executes a read-only query without touching `last_applied`.
    pub fn apply_query(
        &mut self,
        timestamp_ms: u64,
        session: u64,
        sequence: u64,
        query: &Bytes,
    ) -> OperationResult {
        let result = self
            .machine
            .query(timestamp_ms, session, sequence, query)
            .map_err(|e| e.kind());
        OperationResult {
            index: self.last_applied,
            event_index: self.event_index,
            result,
        }
    }

    /// Serializes the machine's state for a snapshot.
    pub fn snapshot(&self) -> std::result::Result<Bytes, StateMachineError> {
        self.machine.snapshot()
    }

    /// Replaces state from a snapshot covering the log up to `index`.
    pub fn restore(
        &mut self,
        data: &Bytes,
        index: LogIndex,
    ) -> std::result::Result<(), StateMachineError> {
        self.machine.restore(data)?;
        self.last_applied = index;
        self.event_index = index;
        Ok(())
    }
}

/// A small in-memory key-value machine for tests and examples.
///
/// Commands are `set <key> <value>`; queries are `get <key>`.
#[derive(Default)]
pub struct MemoryStateMachine {
    data: std::collections::BTreeMap<String, String>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for MemoryStateMachine {
    fn apply(
        &mut self,
        _index: LogIndex,
        _timestamp_ms: u64,
        command: &Bytes,
    ) -> std::result::Result<Bytes, StateMachineError> {
        let text = std::str::from_utf8(command).map_err(|_| StateMachineError::CommandFailure {
            reason: "command is not utf-8".to_string(),
        })?;
        let mut parts = text.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("set"), Some(key), Some(value)) => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(Bytes::new())
            }
            _ => Err(StateMachineError::CommandFailure {
                reason: format!("unrecognized command: {text}"),
            }),
        }
    }

    fn query(
        &mut self,
        _timestamp_ms: u64,
        _session: u64,
        _sequence: u64,
        query: &Bytes,
    ) -> std::result::Result<Bytes, StateMachineError> {
        let text = std::str::from_utf8(query).map_err(|_| StateMachineError::CommandFailure {
            reason: "query is not utf-8".to_string(),
        })?;
        let mut parts = text.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some("get"), Some(key)) => Ok(self
                .data
                .get(key)
                .map(|v| Bytes::from(v.clone()))
                .unwrap_or_default()),
            _ => Err(StateMachineError::CommandFailure {
                reason: format!("unrecognized query: {text}"),
            }),
        }
    }

    fn snapshot(&self) -> std::result::Result<Bytes, StateMachineError> {
        let encoded = bincode::serialize(&self.data).map_err(|e| {
            StateMachineError::ApplicationError {
                reason: e.to_string(),
            }
        })?;
        Ok(Bytes::from(encoded))
    }

    fn restore(&mut self, data: &Bytes) -> std::result::Result<(), StateMachineError> {
        self.data = bincode::deserialize(data).map_err(|e| StateMachineError::ApplicationError {
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
