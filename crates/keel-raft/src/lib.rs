//! keel-raft: the replication core of a Raft consensus server.
//!
//! A server is an actor owning a [`ServerContext`] and a role state
//! (reserve, passive, follower, candidate, leader). Leaders replicate a
//! durable segmented log whose committed prefix is applied, in order, to a
//! deterministic user [`StateMachine`]; passive members materialize only
//! committed entries and serve sequential reads when sufficiently caught
//! up. Snapshots stream in chunks and install atomically. Client routing
//! goes through leader-aware [`selector`]s.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod protocol;
pub(crate) mod roles;
pub mod selector;
pub mod server;
pub mod transport;
pub mod types;

pub use client::RaftClient;
pub use config::{ConfigError, RaftConfig, ServerConfig};
pub use context::ServerContext;
pub use error::{ErrorKind, RaftError, Result};
pub use executor::{
    MemoryStateMachine, OperationResult, StateMachine, StateMachineError, StateMachineExecutor,
};
pub use protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, QueryResponse, ResponseStatus, VoteRequest, VoteResponse,
};
pub use selector::{NodeSelector, NodeSelectorManager, SelectionStrategy};
pub use server::{RaftServer, RaftServerHandle, ServerMessage, ServerStatus};
pub use transport::{InMemoryTransport, RaftTransport, UnreachableTransport};
pub use types::{ConsistencyLevel, Entry, IndexedEntry, LogIndex, NodeId, Role, Term};
