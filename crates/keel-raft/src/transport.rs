//! Transport abstraction for server-to-server RPC.
//!
//! The consensus core sends through the [`RaftTransport`] trait; wire
//! codecs, connection pooling and retries belong to implementations.
//! [`InMemoryTransport`] routes requests to in-process server mailboxes for
//! unit and cluster tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, QueryResponse, VoteRequest, VoteResponse,
};
use crate::server::RaftServerHandle;
use crate::types::NodeId;

/// Sends Raft RPCs to peers.
///
/// All methods are async and may block on network I/O. Implementations
/// resolve `NodeId` to an actual address; transient failures surface as
/// `RaftError::Io` and the caller decides whether to retry.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    /// Replicate entries / heartbeat.
    async fn append(&self, target: &NodeId, request: AppendRequest) -> Result<AppendResponse>;

    /// Solicit a vote during an election.
    async fn vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse>;

    /// Stream one snapshot chunk.
    async fn install(&self, target: &NodeId, request: InstallRequest) -> Result<InstallResponse>;

    /// Forward a client query.
    async fn query(&self, target: &NodeId, request: QueryRequest) -> Result<QueryResponse>;

    /// Forward a client command.
    async fn command(&self, target: &NodeId, request: CommandRequest) -> Result<CommandResponse>;
}

/// In-process transport for tests: requests land directly in the target
/// server's mailbox. Removing a peer simulates a network partition.
#[derive(Default)]
pub struct InMemoryTransport {
    peers: RwLock<HashMap<NodeId, RaftServerHandle>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, peer: NodeId, handle: RaftServerHandle) {
        self.peers.write().insert(peer, handle);
    }

    pub fn remove_peer(&self, peer: &NodeId) {
        self.peers.write().remove(peer);
    }

    fn peer(&self, target: &NodeId) -> Result<RaftServerHandle> {
        self.peers
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| RaftError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("peer not reachable: {target}"),
                ),
            })
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn append(&self, target: &NodeId, request: AppendRequest) -> Result<AppendResponse> {
        self.peer(target)?.append(request).await
    }

    async fn vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        self.peer(target)?.vote(request).await
    }

    async fn install(&self, target: &NodeId, request: InstallRequest) -> Result<InstallResponse> {
        self.peer(target)?.install(request).await
    }

    async fn query(&self, target: &NodeId, request: QueryRequest) -> Result<QueryResponse> {
        self.peer(target)?.query(request).await
    }

    async fn command(&self, target: &NodeId, request: CommandRequest) -> Result<CommandResponse> {
        self.peer(target)?.command(request).await
    }
}

/// A transport that reaches nobody; every send fails. Useful for
/// single-server tests where replication results never arrive.
pub struct UnreachableTransport;

#[async_trait]
impl RaftTransport for UnreachableTransport {
    async fn append(&self, target: &NodeId, _request: AppendRequest) -> Result<AppendResponse> {
        Err(unreachable_error(target))
    }

    async fn vote(&self, target: &NodeId, _request: VoteRequest) -> Result<VoteResponse> {
        Err(unreachable_error(target))
    }

    async fn install(&self, target: &NodeId, _request: InstallRequest) -> Result<InstallResponse> {
        Err(unreachable_error(target))
    }

    async fn query(&self, target: &NodeId, _request: QueryRequest) -> Result<QueryResponse> {
        Err(unreachable_error(target))
    }

    async fn command(&self, target: &NodeId, _request: CommandRequest) -> Result<CommandResponse> {
        Err(unreachable_error(target))
    }
}

fn unreachable_error(target: &NodeId) -> RaftError {
    RaftError::Io {
        source: std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            format!("no route to {target}"),
        ),
    }
}
