//! Client-side submission session.
//!
//! Routes commands and queries through [`NodeSelector`]s, retrying against
//! the next candidate on `NO_LEADER` / `ILLEGAL_MEMBER_STATE` and refreshing
//! the routing view when a pass comes up empty. Sequence numbers scope
//! at-most-once execution within the session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{ErrorKind, RaftError, Result};
use crate::protocol::{CommandRequest, CommandResponse, QueryRequest, QueryResponse, ResponseStatus};
use crate::selector::{NodeSelectorManager, SelectionStrategy};
use crate::transport::RaftTransport;
use crate::types::{ConsistencyLevel, LogIndex, NodeId};

/// A client session against the cluster.
pub struct RaftClient {
    transport: Arc<dyn RaftTransport>,
    manager: NodeSelectorManager,
    session: u64,
    sequence: AtomicU64,
}

impl RaftClient {
    /// Creates a session with no known leader; the first pass will try
    /// servers in order until one responds.
    pub fn new(transport: Arc<dyn RaftTransport>, servers: Vec<NodeId>) -> Self {
        let manager = NodeSelectorManager::new();
        manager.reset_all_with(None, servers);
        Self {
            transport,
            manager,
            session: 0,
            sequence: AtomicU64::new(0),
        }
    }

    /// Binds this client to a registered session (the log index of the
    /// session-registration entry).
    pub fn with_session(mut self, session: u64) -> Self {
        self.session = session;
        self
    }

    /// The routing manager, shared with any other sessions on this client.
    pub fn manager(&self) -> &NodeSelectorManager {
        &self.manager
    }

    /// Updates the routing view, e.g. after learning the leader changed.
    pub fn reset_routing(&self, leader: Option<NodeId>, servers: Vec<NodeId>) {
        self.manager.reset_all_with(leader, servers);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Submits a command, retrying across servers until one accepts it.
    pub async fn command(&self, bytes: Bytes) -> Result<CommandResponse> {
        let request = CommandRequest {
            session: self.session,
            sequence: self.next_sequence(),
            bytes,
        };

        let mut selector = self
            .manager
            .create_selector(SelectionStrategy::AnyWithFallback);
        while let Some(target) = selector.next() {
            match self.transport.command(&target, request.clone()).await {
                Ok(response) if retryable(response.status, response.error) => {
                    tracing::trace!(target = %target, "command not served here, trying next");
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::trace!(target = %target, error = %e, "command send failed");
                }
            }
        }

        Err(RaftError::NotLeader {
            leader: self.manager.leader(),
        })
    }

    /// Submits a query at the requested consistency level.
    ///
    /// Sequential reads may land on any server; stronger levels go to the
    /// leader first (any server will still forward if routing is stale).
    pub async fn query(
        &self,
        bytes: Bytes,
        consistency: ConsistencyLevel,
    ) -> Result<QueryResponse> {
        let request = QueryRequest {
            session: self.session,
            sequence: self.next_sequence(),
            index: LogIndex::ZERO,
            consistency,
            bytes,
        };

        let strategy = match consistency {
            ConsistencyLevel::Sequential => SelectionStrategy::Any,
            ConsistencyLevel::BoundedLinearizable | ConsistencyLevel::Linearizable => {
                SelectionStrategy::AnyWithFallback
            }
        };

        let mut selector = self.manager.create_selector(strategy);
        while let Some(target) = selector.next() {
            match self.transport.query(&target, request.clone()).await {
                Ok(response) if retryable(response.status, response.error) => {
                    tracing::trace!(target = %target, "query not served here, trying next");
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::trace!(target = %target, error = %e, "query send failed");
                }
            }
        }

        Err(RaftError::NotLeader {
            leader: self.manager.leader(),
        })
    }
}

/// Routing-level failures worth retrying elsewhere; application-level
/// failures surface to the caller.
fn retryable(status: ResponseStatus, error: Option<ErrorKind>) -> bool {
    status == ResponseStatus::Error
        && matches!(
            error,
            Some(ErrorKind::NoLeader) | Some(ErrorKind::IllegalMemberState)
        )
}
