//! Protocol messages exchanged between servers and clients.
//!
//! Only the logical fields are defined here; the transport decides how they
//! travel. All messages are serde types with bincode as the reference
//! encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{ConsistencyLevel, IndexedEntry, LogIndex, NodeId, Term};

/// Outcome discriminator shared by all responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Replicates entries from the leader; an empty entry list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's id, so servers can redirect clients.
    pub leader: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub log_index: LogIndex,
    /// Term of the entry at `log_index`.
    pub log_term: Term,
    /// Entries to replicate.
    pub entries: Vec<IndexedEntry>,
    /// Leader's commit index.
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub status: ResponseStatus,
    pub term: Term,
    pub succeeded: bool,
    /// On success, the index of the last entry covered by the request; on
    /// rejection, this server's last index (the leader's backtracking hint).
    pub log_index: LogIndex,
    pub error: Option<ErrorKind>,
}

impl AppendResponse {
    pub fn succeeded(term: Term, log_index: LogIndex) -> Self {
        Self {
            status: ResponseStatus::Ok,
            term,
            succeeded: true,
            log_index,
            error: None,
        }
    }

    pub fn rejected(term: Term, log_index: LogIndex) -> Self {
        Self {
            status: ResponseStatus::Ok,
            term,
            succeeded: false,
            log_index,
            error: None,
        }
    }

    pub fn error(term: Term, log_index: LogIndex, kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            term,
            succeeded: false,
            log_index,
            error: Some(kind),
        }
    }
}

/// One chunk of a streamed snapshot install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub term: Term,
    pub leader: NodeId,
    /// Snapshot identity.
    pub id: u64,
    /// Index up to which the snapshot covers the log.
    pub index: LogIndex,
    /// Chunk number, starting at 0. Offsets count chunks, not bytes.
    pub offset: u32,
    pub data: Bytes,
    /// True on the final chunk.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
}

impl InstallResponse {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(kind),
        }
    }
}

/// Requests a vote during an election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub status: ResponseStatus,
    pub term: Term,
    pub voted: bool,
    pub error: Option<ErrorKind>,
}

impl VoteResponse {
    pub fn granted(term: Term) -> Self {
        Self {
            status: ResponseStatus::Ok,
            term,
            voted: true,
            error: None,
        }
    }

    pub fn denied(term: Term) -> Self {
        Self {
            status: ResponseStatus::Ok,
            term,
            voted: false,
            error: None,
        }
    }

    pub fn error(term: Term, kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            term,
            voted: false,
            error: Some(kind),
        }
    }
}

/// A client read routed through the consensus layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The client's session: the log index at which the session was
    /// registered. Used as the freshness bound for local reads.
    pub session: u64,
    /// Sequence number scoping at-most-once execution within the session.
    pub sequence: u64,
    /// Client's last seen index.
    pub index: LogIndex,
    pub consistency: ConsistencyLevel,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub index: LogIndex,
    pub event_index: LogIndex,
    pub result: Option<Bytes>,
    pub error: Option<ErrorKind>,
}

impl QueryResponse {
    pub fn ok(index: LogIndex, event_index: LogIndex, result: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            index,
            event_index,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            index: LogIndex::ZERO,
            event_index: LogIndex::ZERO,
            result: None,
            error: Some(kind),
        }
    }

    pub fn error_at(index: LogIndex, event_index: LogIndex, kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            index,
            event_index,
            result: None,
            error: Some(kind),
        }
    }
}

/// A client command destined for the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session: u64,
    pub sequence: u64,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub index: LogIndex,
    pub event_index: LogIndex,
    pub result: Option<Bytes>,
    pub error: Option<ErrorKind>,
}

impl CommandResponse {
    pub fn ok(index: LogIndex, event_index: LogIndex, result: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            index,
            event_index,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            index: LogIndex::ZERO,
            event_index: LogIndex::ZERO,
            result: None,
            error: Some(kind),
        }
    }

    pub fn error_at(index: LogIndex, event_index: LogIndex, kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            index,
            event_index,
            result: None,
            error: Some(kind),
        }
    }
}
