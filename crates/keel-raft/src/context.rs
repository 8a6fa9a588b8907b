//! Process-wide replicated server state.
//!
//! The context is owned by exactly one server task; every role handler runs
//! on that task and calls [`ServerContext::check_thread`] on entry. There is
//! no locking on context fields — ownership by the actor is the
//! serialization guarantee; the log's writer lock is the only lock below.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use keel_observe::{Meter, ServerEvt, ServerKind, VizEvent};
use keel_storage::{MetaStore, Metadata, SegmentedLog, SnapshotStore};

use crate::error::Result;
use crate::executor::StateMachineExecutor;
use crate::types::{LogIndex, NodeId, Role, Term};

tokio::task_local! {
    /// Identifies the server task currently executing, if any.
    pub(crate) static SERVER_TASK: u64;
}

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Replicated state and storage handles for one server.
pub struct ServerContext {
    server_id: u64,
    node_id: NodeId,
    members: Vec<NodeId>,
    node_ord: u32,

    term: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    commit_index: LogIndex,
    role: Role,

    log: SegmentedLog,
    snapshots: SnapshotStore,
    meta: MetaStore,
    executor: StateMachineExecutor,
    meter: Arc<dyn Meter>,

    /// Last time a valid leader (or granted vote) was observed.
    last_leader_contact: Instant,
    pending_transition: Option<Role>,
}

impl ServerContext {
    pub fn new(
        node_id: NodeId,
        members: Vec<NodeId>,
        log: SegmentedLog,
        snapshots: SnapshotStore,
        meta: MetaStore,
        executor: StateMachineExecutor,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        let persisted = meta.load()?;
        let node_ord = members
            .iter()
            .position(|m| m == &node_id)
            .map(|p| p as u32)
            .unwrap_or(0);

        Ok(Self {
            server_id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
            node_id,
            members,
            node_ord,
            term: Term(persisted.term),
            voted_for: persisted.voted_for.map(NodeId::new),
            leader: None,
            commit_index: LogIndex::ZERO,
            role: Role::Reserve,
            log,
            snapshots,
            meta,
            executor,
            meter,
            last_leader_contact: Instant::now(),
            pending_transition: None,
        })
    }

    pub(crate) fn server_id(&self) -> u64 {
        self.server_id
    }

    /// Asserts that the caller is running on this server's owning task.
    ///
    /// Every role handler calls this on entry; a violation is a bug in the
    /// embedding, not a recoverable condition.
    pub fn check_thread(&self) {
        let current = SERVER_TASK.try_with(|id| *id).ok();
        assert_eq!(
            current,
            Some(self.server_id),
            "role handler invoked off the server task"
        );
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// All members except this server.
    pub fn peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| *m != &self.node_id)
            .cloned()
            .collect()
    }

    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn term(&self) -> Term {
        self.term
    }

    /// Advances the term, clearing the vote and the known leader.
    /// The new term is persisted before this returns.
    pub fn set_term(&mut self, term: Term) -> Result<()> {
        debug_assert!(term >= self.term, "terms never move backwards");
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            self.persist_meta()?;
        }
        Ok(())
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    /// Records a vote in the current term, durably.
    pub fn vote_for(&mut self, candidate: NodeId) -> Result<()> {
        self.voted_for = Some(candidate);
        self.persist_meta()
    }

    fn persist_meta(&self) -> Result<()> {
        self.meta.store(&Metadata {
            term: self.term.as_u64(),
            voted_for: self.voted_for.as_ref().map(|n| n.0.clone()),
        })?;
        Ok(())
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn set_leader(&mut self, leader: Option<NodeId>) {
        if self.leader != leader {
            if let Some(ref l) = leader {
                tracing::debug!(leader = %l, term = %self.term, "observed leader");
            }
            self.leader = leader;
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Advances the commit index. Never moves backwards.
    pub fn set_commit_index(&mut self, index: LogIndex) {
        if index > self.commit_index {
            self.commit_index = index;
            self.log.set_commit_index(index);
            self.meter.emit(VizEvent::Server(ServerEvt {
                node: self.node_ord,
                term: self.term.as_u64(),
                kind: ServerKind::CommitAdvanced {
                    index: index.as_u64(),
                },
            }));
        }
    }

    pub fn last_applied(&self) -> LogIndex {
        self.executor.last_applied()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        if self.role != role {
            tracing::info!(from = %self.role, to = %role, term = %self.term, "role transition");
            self.role = role;
            self.meter.emit(VizEvent::Server(ServerEvt {
                node: self.node_ord,
                term: self.term.as_u64(),
                kind: ServerKind::RoleChanged {
                    role: role.as_str(),
                },
            }));
        }
    }

    /// Requests a role change; the server loop performs it after the current
    /// handler returns.
    pub fn request_transition(&mut self, role: Role) {
        self.pending_transition = Some(role);
    }

    pub(crate) fn take_transition(&mut self) -> Option<Role> {
        self.pending_transition.take()
    }

    /// Notes contact from a live leader or candidate, deferring elections.
    pub fn touch_leader_contact(&mut self) {
        self.last_leader_contact = Instant::now();
    }

    pub fn last_leader_contact(&self) -> Instant {
        self.last_leader_contact
    }

    pub fn log(&self) -> &SegmentedLog {
        &self.log
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn executor(&mut self) -> &mut StateMachineExecutor {
        &mut self.executor
    }

    pub fn meter(&self) -> &Arc<dyn Meter> {
        &self.meter
    }

    pub(crate) fn node_ord(&self) -> u32 {
        self.node_ord
    }

    /// Checks the core ordering invariant at a quiescent point.
    pub fn assert_invariants(&self) {
        debug_assert!(
            self.last_applied() <= self.commit_index,
            "last_applied {} > commit_index {}",
            self.last_applied(),
            self.commit_index
        );
        debug_assert!(
            self.commit_index <= self.log.last_index(),
            "commit_index {} beyond log end {}",
            self.commit_index,
            self.log.last_index()
        );
    }
}
