//! The reserve role: the quiescent baseline.
//!
//! Reserve members hold their place in the cluster but reject replication,
//! query and election traffic. The server also retreats here when storage
//! fails, so the role must touch nothing on disk.

use crate::context::ServerContext;
use crate::error::{ErrorKind, Result};
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, QueryResponse, VoteRequest, VoteResponse,
};
use crate::roles::{CommandAction, QueryAction};

pub(crate) struct ReserveRole;

impl ReserveRole {
    pub fn new() -> Self {
        ReserveRole
    }

    pub fn open(&mut self, _ctx: &mut ServerContext) -> Result<()> {
        Ok(())
    }

    pub fn close(&mut self, _ctx: &mut ServerContext) {}

    pub fn append(
        &mut self,
        ctx: &mut ServerContext,
        _request: AppendRequest,
    ) -> Result<AppendResponse> {
        ctx.check_thread();
        Ok(AppendResponse::error(
            ctx.term(),
            ctx.log().last_index(),
            ErrorKind::IllegalMemberState,
        ))
    }

    pub fn install(
        &mut self,
        ctx: &mut ServerContext,
        _request: InstallRequest,
    ) -> Result<InstallResponse> {
        ctx.check_thread();
        Ok(InstallResponse::error(ErrorKind::IllegalMemberState))
    }

    pub fn query(
        &mut self,
        ctx: &mut ServerContext,
        _request: QueryRequest,
    ) -> Result<QueryAction> {
        ctx.check_thread();
        Ok(QueryAction::Respond(QueryResponse::error(
            ErrorKind::IllegalMemberState,
        )))
    }

    pub fn vote(&mut self, ctx: &mut ServerContext, _request: VoteRequest) -> Result<VoteResponse> {
        ctx.check_thread();
        Ok(VoteResponse::error(
            ctx.term(),
            ErrorKind::IllegalMemberState,
        ))
    }

    pub fn command(
        &mut self,
        ctx: &mut ServerContext,
        _request: CommandRequest,
    ) -> Result<CommandAction> {
        ctx.check_thread();
        Ok(CommandAction::Respond(CommandResponse::error(
            ErrorKind::IllegalMemberState,
        )))
    }
}
