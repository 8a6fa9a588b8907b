//! The leader role.
//!
//! On open the leader initializes per-follower replication cursors and
//! appends a no-op entry so its term has something to commit. The server
//! loop drives replication on the heartbeat tick via `prepare_append` and
//! feeds responses back through `handle_append_result`, which advances the
//! commit index by quorum counting. Only entries from the current term
//! commit by counting; earlier terms commit transitively.

use std::collections::HashMap;

use keel_observe::{ServerEvt, ServerKind, VizEvent};

use crate::context::ServerContext;
use crate::error::{ErrorKind, Result};
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, InstallRequest, InstallResponse,
    QueryRequest, VoteRequest, VoteResponse,
};
use crate::roles::common;
use crate::roles::{CommandAction, QueryAction};
use crate::types::{Entry, LogIndex, NodeId, Role, Term};

pub(crate) struct LeaderRole {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderRole {
    pub fn new() -> Self {
        Self {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    pub fn open(&mut self, ctx: &mut ServerContext) -> Result<()> {
        ctx.set_leader(Some(ctx.node_id().clone()));

        let next = ctx.log().last_index().next();
        for peer in ctx.peers() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, LogIndex::ZERO);
        }

        // Commit the new term by replicating a no-op; Raft forbids counting
        // replicas for entries from earlier terms.
        let term = ctx.term();
        let timestamp_ms = common::wall_clock_ms();
        {
            let writer = ctx.log().writer();
            let mut guard = writer.lock();
            guard.append(Entry::Noop { timestamp_ms }, term)?;
        }

        ctx.meter().emit(VizEvent::Server(ServerEvt {
            node: ctx.node_ord(),
            term: term.as_u64(),
            kind: ServerKind::LeaderElected,
        }));
        tracing::info!(term = %term, "elected leader");

        // A single-node cluster commits immediately.
        self.try_advance_commit(ctx)?;
        Ok(())
    }

    pub fn close(&mut self, _ctx: &mut ServerContext) {
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Builds the replication request for one follower.
    pub fn prepare_append(
        &self,
        ctx: &ServerContext,
        peer: &NodeId,
        max_entries: usize,
    ) -> Result<AppendRequest> {
        let last_index = ctx.log().last_index();
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or_else(|| last_index.next());

        let prev_index = next.prev().unwrap_or(LogIndex::ZERO);
        let mut reader = ctx.log().reader();
        let prev_term = if prev_index == LogIndex::ZERO {
            Term::ZERO
        } else {
            reader
                .get(prev_index)?
                .map(|e| e.term)
                .unwrap_or(Term::ZERO)
        };

        let mut entries = Vec::new();
        let mut index = next;
        while index <= last_index && entries.len() < max_entries {
            match reader.get(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.next();
        }

        Ok(AppendRequest {
            term: ctx.term(),
            leader: ctx.node_id().clone(),
            log_index: prev_index,
            log_term: prev_term,
            entries,
            commit_index: ctx.commit_index(),
        })
    }

    /// Feeds back one follower's append response.
    pub fn handle_append_result(
        &mut self,
        ctx: &mut ServerContext,
        peer: NodeId,
        sent_term: Term,
        response: &AppendResponse,
    ) -> Result<()> {
        if response.term > ctx.term() {
            common::update_term_and_leader(ctx, response.term, None)?;
            return Ok(());
        }
        // A round from an earlier term says nothing about current progress.
        if sent_term != ctx.term() {
            return Ok(());
        }

        if response.succeeded {
            self.match_index.insert(peer.clone(), response.log_index);
            self.next_index.insert(peer, response.log_index.next());
            self.try_advance_commit(ctx)?;
        } else {
            // The follower's reported last index is the backtracking hint.
            let current = self
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or_else(|| ctx.log().last_index().next());
            let stepped = current.prev().unwrap_or(LogIndex(1));
            let hinted = response.log_index.next();
            let next = stepped.min(hinted).max(LogIndex(1));
            self.next_index.insert(peer, next);
        }
        Ok(())
    }

    /// Advances the commit index to the highest entry of the current term
    /// replicated on a quorum, then applies the newly committed prefix.
    fn try_advance_commit(&mut self, ctx: &mut ServerContext) -> Result<()> {
        let current_term = ctx.term();
        let last_index = ctx.log().last_index();
        let quorum = ctx.quorum_size();
        let mut reader = ctx.log().reader();

        let mut best = ctx.commit_index();
        let mut candidate = best.next();
        while candidate <= last_index {
            let replicas = 1 + self
                .match_index
                .values()
                .filter(|&&m| m >= candidate)
                .count();
            if replicas < quorum {
                break;
            }
            let entry_term = reader.get(candidate)?.map(|e| e.term);
            if entry_term == Some(current_term) {
                best = candidate;
            }
            candidate = candidate.next();
        }

        if best > ctx.commit_index() {
            ctx.set_commit_index(best);
            let mut reader = ctx.log().reader();
            ctx.executor().apply_all(&mut reader, best)?;
            ctx.assert_invariants();
        }
        Ok(())
    }

    pub fn append(
        &mut self,
        ctx: &mut ServerContext,
        request: AppendRequest,
    ) -> Result<AppendResponse> {
        ctx.check_thread();
        if request.term > ctx.term() {
            common::update_term_and_leader(ctx, request.term, Some(request.leader.clone()))?;
            ctx.request_transition(Role::Follower);
            return common::handle_append(ctx, &request, false);
        }
        // Two leaders in one term cannot happen; a stale peer gets our term.
        tracing::warn!(
            from = %request.leader,
            term = %request.term,
            "append received while leading"
        );
        Ok(AppendResponse::rejected(
            ctx.term(),
            ctx.log().last_index(),
        ))
    }

    pub fn install(
        &mut self,
        ctx: &mut ServerContext,
        request: InstallRequest,
    ) -> Result<InstallResponse> {
        ctx.check_thread();
        if request.term > ctx.term() {
            common::update_term_and_leader(ctx, request.term, Some(request.leader.clone()))?;
            ctx.request_transition(Role::Follower);
        }
        Ok(InstallResponse::error(ErrorKind::IllegalMemberState))
    }

    /// Leaders serve every consistency level locally: the state machine is
    /// applied up to the commit index before the query runs.
    pub fn query(
        &mut self,
        ctx: &mut ServerContext,
        request: QueryRequest,
    ) -> Result<QueryAction> {
        ctx.check_thread();
        let commit = ctx.commit_index();
        let mut reader = ctx.log().reader();
        ctx.executor().apply_all(&mut reader, commit)?;
        Ok(QueryAction::Respond(common::apply_query(ctx, &request)))
    }

    pub fn vote(&mut self, ctx: &mut ServerContext, request: VoteRequest) -> Result<VoteResponse> {
        ctx.check_thread();
        common::update_term_and_leader(ctx, request.term, None)?;
        // In our own term we already voted for ourselves.
        common::handle_vote(ctx, &request)
    }

    /// Appends the command and resolves the caller's future once the entry
    /// commits and applies.
    pub fn command(
        &mut self,
        ctx: &mut ServerContext,
        request: CommandRequest,
    ) -> Result<CommandAction> {
        ctx.check_thread();
        let term = ctx.term();
        let timestamp_ms = common::wall_clock_ms();

        let appended = {
            let writer = ctx.log().writer();
            let mut guard = writer.lock();
            guard.append(
                Entry::Command {
                    timestamp_ms,
                    bytes: request.bytes,
                },
                term,
            )?
        };

        let rx = ctx.executor().register_waiter(appended.index);

        // A single-node cluster can commit without waiting for a heartbeat.
        self.try_advance_commit(ctx)?;

        Ok(CommandAction::Wait(rx))
    }
}
