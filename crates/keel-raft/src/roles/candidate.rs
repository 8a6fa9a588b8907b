//! The candidate role: an election in progress.
//!
//! Opening the role increments the term and votes for self; the server loop
//! solicits votes from peers and feeds the responses back through
//! `record_vote`. A quorum promotes to leader; any valid append from the
//! new term's leader demotes back to follower.

use std::collections::HashSet;

use crate::context::ServerContext;
use crate::error::{ErrorKind, Result};
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, VoteRequest, VoteResponse,
};
use crate::roles::common;
use crate::roles::{CommandAction, QueryAction};
use crate::types::{NodeId, Role};

pub(crate) struct CandidateRole {
    votes: HashSet<NodeId>,
}

impl CandidateRole {
    pub fn new() -> Self {
        Self {
            votes: HashSet::new(),
        }
    }

    pub fn open(&mut self, ctx: &mut ServerContext) -> Result<()> {
        let term = ctx.term().next();
        ctx.set_term(term)?;
        ctx.vote_for(ctx.node_id().clone())?;
        ctx.touch_leader_contact();

        self.votes.clear();
        self.votes.insert(ctx.node_id().clone());
        tracing::info!(term = %term, "started election");

        // A single-node cluster is its own quorum.
        if self.votes.len() >= ctx.quorum_size() {
            ctx.request_transition(Role::Leader);
        }
        Ok(())
    }

    pub fn close(&mut self, _ctx: &mut ServerContext) {
        self.votes.clear();
    }

    /// Feeds back one peer's vote response.
    pub fn record_vote(
        &mut self,
        ctx: &mut ServerContext,
        peer: NodeId,
        response: &VoteResponse,
    ) -> Result<()> {
        if response.term > ctx.term() {
            common::update_term_and_leader(ctx, response.term, None)?;
            return Ok(());
        }
        if response.term == ctx.term() && response.voted {
            self.votes.insert(peer);
            if self.votes.len() >= ctx.quorum_size() {
                ctx.request_transition(Role::Leader);
            }
        }
        Ok(())
    }

    pub fn append(
        &mut self,
        ctx: &mut ServerContext,
        request: AppendRequest,
    ) -> Result<AppendResponse> {
        ctx.check_thread();
        // An append at our term or higher means this election lost.
        if request.term >= ctx.term() {
            common::update_term_and_leader(ctx, request.term, Some(request.leader.clone()))?;
            ctx.request_transition(Role::Follower);
            return common::handle_append(ctx, &request, false);
        }
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
        // Step down and let the leader restart the install against the
        // follower role from chunk 0.
        if request.term >= ctx.term() {
            common::update_term_and_leader(ctx, request.term, Some(request.leader.clone()))?;
            ctx.request_transition(Role::Follower);
        }
        Ok(InstallResponse::error(ErrorKind::IllegalMemberState))
    }

    pub fn query(
        &mut self,
        ctx: &mut ServerContext,
        request: QueryRequest,
    ) -> Result<QueryAction> {
        ctx.check_thread();
        common::handle_query(ctx, request)
    }

    pub fn vote(&mut self, ctx: &mut ServerContext, request: VoteRequest) -> Result<VoteResponse> {
        ctx.check_thread();
        common::update_term_and_leader(ctx, request.term, None)?;
        common::handle_vote(ctx, &request)
    }

    pub fn command(
        &mut self,
        ctx: &mut ServerContext,
        request: CommandRequest,
    ) -> Result<CommandAction> {
        ctx.check_thread();
        match ctx.leader() {
            Some(leader) => Ok(CommandAction::Forward(leader.clone(), request)),
            None => Ok(CommandAction::Respond(CommandResponse::error(
                ErrorKind::NoLeader,
            ))),
        }
    }
}
