//! The follower role: a voting replica.
//!
//! Followers share the passive install/query contract but write the full
//! entry batch from accepted appends, cast votes, and start elections when
//! the leader goes quiet (the election timer lives in the server loop).

use crate::context::ServerContext;
use crate::error::{ErrorKind, Result};
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, VoteRequest, VoteResponse,
};
use crate::roles::common::{self, PendingSnapshots};
use crate::roles::{CommandAction, QueryAction};

pub(crate) struct FollowerRole {
    pending: PendingSnapshots,
}

impl FollowerRole {
    pub fn new() -> Self {
        Self {
            pending: PendingSnapshots::new(),
        }
    }

    pub fn open(&mut self, ctx: &mut ServerContext) -> Result<()> {
        // Restart the election window from scratch.
        ctx.touch_leader_contact();
        Ok(())
    }

    pub fn close(&mut self, ctx: &mut ServerContext) {
        let _ = ctx;
        self.pending.discard_all();
    }

    pub fn append(
        &mut self,
        ctx: &mut ServerContext,
        request: AppendRequest,
    ) -> Result<AppendResponse> {
        ctx.check_thread();
        common::update_term_and_leader(ctx, request.term, Some(request.leader.clone()))?;
        common::handle_append(ctx, &request, false)
    }

    pub fn install(
        &mut self,
        ctx: &mut ServerContext,
        request: InstallRequest,
    ) -> Result<InstallResponse> {
        ctx.check_thread();
        common::update_term_and_leader(ctx, request.term, Some(request.leader.clone()))?;
        common::handle_install(ctx, &mut self.pending, &request)
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
