//! Role states and request dispatch.
//!
//! Roles are tagged variants over a common capability set
//! (`open`, `close`, `append`, `install`, `query`, `vote`, `command`).
//! Shared behavior lives in free functions in [`common`] taking
//! `&mut ServerContext`; each role module layers its own duties on top.
//!
//! Handlers never perform network I/O themselves: forwarding and waiting are
//! expressed as [`QueryAction`] / [`CommandAction`] values that the server
//! loop executes off the context task.

pub(crate) mod candidate;
pub(crate) mod common;
pub(crate) mod follower;
pub(crate) mod leader;
pub(crate) mod passive;
pub(crate) mod reserve;

use tokio::sync::oneshot;

use crate::context::ServerContext;
use crate::error::Result;
use crate::executor::OperationResult;
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, QueryResponse, VoteRequest, VoteResponse,
};
use crate::types::{NodeId, Role};

pub(crate) use candidate::CandidateRole;
pub(crate) use follower::FollowerRole;
pub(crate) use leader::LeaderRole;
pub(crate) use passive::PassiveRole;
pub(crate) use reserve::ReserveRole;

/// How the server loop should finish a query.
#[derive(Debug)]
pub enum QueryAction {
    /// Reply immediately.
    Respond(QueryResponse),
    /// Relay to the named server and return its response verbatim.
    Forward(NodeId, QueryRequest),
}

/// How the server loop should finish a command.
#[derive(Debug)]
pub enum CommandAction {
    /// Reply immediately.
    Respond(CommandResponse),
    /// Relay to the named server and return its response verbatim.
    Forward(NodeId, CommandRequest),
    /// Reply once the appended entry has been committed and applied.
    Wait(oneshot::Receiver<OperationResult>),
}

/// The current role and its per-role state.
pub(crate) enum RoleState {
    Reserve(ReserveRole),
    Passive(PassiveRole),
    Follower(FollowerRole),
    Candidate(CandidateRole),
    Leader(LeaderRole),
}

impl RoleState {
    pub fn new(role: Role) -> Self {
        match role {
            Role::Reserve => RoleState::Reserve(ReserveRole::new()),
            Role::Passive => RoleState::Passive(PassiveRole::new()),
            Role::Follower => RoleState::Follower(FollowerRole::new()),
            Role::Candidate => RoleState::Candidate(CandidateRole::new()),
            Role::Leader => RoleState::Leader(LeaderRole::new()),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            RoleState::Reserve(_) => Role::Reserve,
            RoleState::Passive(_) => Role::Passive,
            RoleState::Follower(_) => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }

    pub fn open(&mut self, ctx: &mut ServerContext) -> Result<()> {
        ctx.set_role(self.role());
        match self {
            RoleState::Reserve(r) => r.open(ctx),
            RoleState::Passive(r) => r.open(ctx),
            RoleState::Follower(r) => r.open(ctx),
            RoleState::Candidate(r) => r.open(ctx),
            RoleState::Leader(r) => r.open(ctx),
        }
    }

    pub fn close(&mut self, ctx: &mut ServerContext) {
        match self {
            RoleState::Reserve(r) => r.close(ctx),
            RoleState::Passive(r) => r.close(ctx),
            RoleState::Follower(r) => r.close(ctx),
            RoleState::Candidate(r) => r.close(ctx),
            RoleState::Leader(r) => r.close(ctx),
        }
    }

    pub fn append(
        &mut self,
        ctx: &mut ServerContext,
        request: AppendRequest,
    ) -> Result<AppendResponse> {
        match self {
            RoleState::Reserve(r) => r.append(ctx, request),
            RoleState::Passive(r) => r.append(ctx, request),
            RoleState::Follower(r) => r.append(ctx, request),
            RoleState::Candidate(r) => r.append(ctx, request),
            RoleState::Leader(r) => r.append(ctx, request),
        }
    }

    pub fn install(
        &mut self,
        ctx: &mut ServerContext,
        request: InstallRequest,
    ) -> Result<InstallResponse> {
        match self {
            RoleState::Reserve(r) => r.install(ctx, request),
            RoleState::Passive(r) => r.install(ctx, request),
            RoleState::Follower(r) => r.install(ctx, request),
            RoleState::Candidate(r) => r.install(ctx, request),
            RoleState::Leader(r) => r.install(ctx, request),
        }
    }

    pub fn query(
        &mut self,
        ctx: &mut ServerContext,
        request: QueryRequest,
    ) -> Result<QueryAction> {
        match self {
            RoleState::Reserve(r) => r.query(ctx, request),
            RoleState::Passive(r) => r.query(ctx, request),
            RoleState::Follower(r) => r.query(ctx, request),
            RoleState::Candidate(r) => r.query(ctx, request),
            RoleState::Leader(r) => r.query(ctx, request),
        }
    }

    pub fn vote(&mut self, ctx: &mut ServerContext, request: VoteRequest) -> Result<VoteResponse> {
        match self {
            RoleState::Reserve(r) => r.vote(ctx, request),
            RoleState::Passive(r) => r.vote(ctx, request),
            RoleState::Follower(r) => r.vote(ctx, request),
            RoleState::Candidate(r) => r.vote(ctx, request),
            RoleState::Leader(r) => r.vote(ctx, request),
        }
    }

    pub fn command(
        &mut self,
        ctx: &mut ServerContext,
        request: CommandRequest,
    ) -> Result<CommandAction> {
        match self {
            RoleState::Reserve(r) => r.command(ctx, request),
            RoleState::Passive(r) => r.command(ctx, request),
            RoleState::Follower(r) => r.command(ctx, request),
            RoleState::Candidate(r) => r.command(ctx, request),
            RoleState::Leader(r) => r.command(ctx, request),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for role handler tests.

    use std::path::Path;
    use std::sync::Arc;

    use bytes::Bytes;
    use keel_observe::NoopMeter;
    use keel_storage::{LogConfig, MetaStore, SegmentedLog, SnapshotStore};

    use crate::context::{ServerContext, SERVER_TASK};
    use crate::executor::{MemoryStateMachine, StateMachineExecutor};
    use crate::types::{Entry, IndexedEntry, LogIndex, NodeId, Term};

    /// Builds a context rooted at `dir` with the given membership; the
    /// first member is the local node.
    pub fn context(dir: &Path, members: &[&str]) -> ServerContext {
        let (log, _) = SegmentedLog::open(LogConfig {
            dir: dir.join("log"),
            ..Default::default()
        })
        .unwrap();
        let snapshots = SnapshotStore::open(dir.join("snapshots")).unwrap();
        let meta = MetaStore::open(dir.join("meta")).unwrap();
        let executor = StateMachineExecutor::new(Box::new(MemoryStateMachine::new()));

        ServerContext::new(
            NodeId::new(members[0]),
            members.iter().map(|m| NodeId::new(*m)).collect(),
            log,
            snapshots,
            meta,
            executor,
            Arc::new(NoopMeter),
        )
        .unwrap()
    }

    /// Runs `f` inside the owning-task scope for `server_id` so
    /// `check_thread` passes, as it would under the real server loop.
    pub fn on_server_task<R>(server_id: u64, f: impl FnOnce() -> R) -> R {
        SERVER_TASK.sync_scope(server_id, f)
    }

    /// Appends `set kN N` commands at the next indices.
    pub fn seed_commands(ctx: &ServerContext, term: Term, count: u64) {
        let writer = ctx.log().writer();
        let mut guard = writer.lock();
        for _ in 0..count {
            let n = guard.last_index().as_u64() + 1;
            guard
                .append(
                    Entry::Command {
                        timestamp_ms: 0,
                        bytes: Bytes::from(format!("set k{n} {n}")),
                    },
                    term,
                )
                .unwrap();
        }
    }

    /// A command entry carrying `payload` at an explicit position.
    pub fn command_at(index: u64, term: u64, payload: &str) -> IndexedEntry {
        IndexedEntry::new(
            LogIndex(index),
            Term(term),
            Entry::Command {
                timestamp_ms: 0,
                bytes: Bytes::copy_from_slice(payload.as_bytes()),
            },
        )
    }
}
