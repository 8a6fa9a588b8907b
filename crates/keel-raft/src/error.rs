//! Consensus error types and the wire-level error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::NodeId;

/// Wire-level error kinds carried in responses.
///
/// These are the only failures a remote caller ever sees; internal faults
/// are collapsed into `InternalError` at the response boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NoLeader,
    IllegalMemberState,
    CommandFailure,
    ApplicationError,
    InternalError,
    UnknownSession,
    ProtocolError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NoLeader => "NO_LEADER",
            ErrorKind::IllegalMemberState => "ILLEGAL_MEMBER_STATE",
            ErrorKind::CommandFailure => "COMMAND_FAILURE",
            ErrorKind::ApplicationError => "APPLICATION_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::UnknownSession => "UNKNOWN_SESSION",
            ErrorKind::ProtocolError => "PROTOCOL_ERROR",
        };
        f.write_str(s)
    }
}

/// Errors produced by the consensus core.
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node cannot serve the request; the caller should retry against
    /// the leader (if one is known).
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The request is not valid for this node's current role or protocol
    /// state (stale term, out-of-order snapshot chunk, ...).
    #[error("illegal member state: {reason}")]
    IllegalMemberState { reason: String },

    /// Durable storage failed; fatal to the current role.
    #[error("storage error: {0}")]
    Storage(#[from] keel_storage::StorageError),

    /// Transport-level failure reaching a peer.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The server's mailbox is closed (shutdown in progress).
    #[error("server closed")]
    Closed,

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Internal invariant violation (a bug).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RaftError {
    /// The wire-level kind this error maps to at the response boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RaftError::NotLeader { .. } => ErrorKind::NoLeader,
            RaftError::IllegalMemberState { .. } => ErrorKind::IllegalMemberState,
            RaftError::Storage(_)
            | RaftError::Io { .. }
            | RaftError::Closed
            | RaftError::Config { .. }
            | RaftError::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// True when the failure poisons the current role (storage faults).
    /// The server escalates these by stepping into the quiescent role.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
