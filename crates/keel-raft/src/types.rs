//! Core consensus types.

use serde::{Deserialize, Serialize};
use std::fmt;

pub use keel_storage::{Entry, IndexedEntry, LogIndex, Term};

/// Node identifier (unique across the cluster).
///
/// A string to support DNS names, UUIDs, or host:port combinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server role.
///
/// `Reserve` and `Passive` are non-voting; only the follower/candidate/leader
/// subset participates in elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Reserve,
    Passive,
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reserve => "reserve",
            Role::Passive => "passive",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }

    /// True for roles that may cast votes.
    pub fn can_vote(self) -> bool {
        matches!(self, Role::Follower | Role::Candidate | Role::Leader)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read consistency requested by a client query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Serve locally when the server has applied the client's session and is
    /// not behind its own commit pointer; otherwise forward to the leader.
    Sequential,
    /// Linearizable within a leader-controlled staleness bound; always
    /// forwarded to the leader.
    BoundedLinearizable,
    /// Fully linearizable; always forwarded to the leader.
    Linearizable,
}
