//! The passive role: a non-voting member.
//!
//! Passive servers accept commit traffic and snapshots but never vote and
//! never serve strongly consistent reads locally. They materialize only
//! committed entries, so their logs can never hold a conflicting tail — the
//! truncation on open enforces that from the previous role's leftovers.

use crate::context::ServerContext;
use crate::error::{ErrorKind, Result};
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, VoteRequest, VoteResponse,
};
use crate::roles::common::{self, PendingSnapshots};
use crate::roles::{CommandAction, QueryAction};

pub(crate) struct PassiveRole {
    pending: PendingSnapshots,
}

impl PassiveRole {
    pub fn new() -> Self {
        Self {
            pending: PendingSnapshots::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn next_snapshot_offset(&self) -> u32 {
        self.pending.next_offset()
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn open(&mut self, ctx: &mut ServerContext) -> Result<()> {
        common::truncate_uncommitted(ctx)
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
        common::handle_append(ctx, &request, true)
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
        // Passive members cannot vote; the candidate should refresh its view
        // of the membership.
        common::update_term_and_leader(ctx, request.term, None)?;
        Ok(VoteResponse::error(
            ctx.term(),
            ErrorKind::IllegalMemberState,
        ))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseStatus;
    use crate::roles::testing::{command_at, context, on_server_task, seed_commands};
    use crate::roles::QueryAction;
    use crate::types::{ConsistencyLevel, LogIndex, NodeId, Term};
    use bytes::Bytes;
    use keel_storage::SnapshotStatus;
    use tempfile::TempDir;

    fn append_request(
        term: u64,
        leader: &str,
        log_index: u64,
        log_term: u64,
        entries: Vec<crate::types::IndexedEntry>,
        commit_index: u64,
    ) -> AppendRequest {
        AppendRequest {
            term: Term(term),
            leader: NodeId::new(leader),
            log_index: LogIndex(log_index),
            log_term: Term(log_term),
            entries,
            commit_index: LogIndex(commit_index),
        }
    }

    fn install_request(
        term: u64,
        id: u64,
        index: u64,
        offset: u32,
        data: &[u8],
        complete: bool,
    ) -> InstallRequest {
        InstallRequest {
            term: Term(term),
            leader: NodeId::new("a"),
            id,
            index: LogIndex(index),
            offset,
            data: Bytes::copy_from_slice(data),
            complete,
        }
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            ctx.set_term(Term(5)).unwrap();
        });
        seed_commands(&ctx, Term(4), 10);

        let response = on_server_task(ctx.server_id(), || {
            role.append(
                &mut ctx,
                append_request(4, "b", 10, 4, Vec::new(), 10),
            )
            .unwrap()
        });

        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.term, Term(5));
        assert!(!response.succeeded);
        assert_eq!(response.log_index, LogIndex(10));
        assert_eq!(ctx.log().last_index(), LogIndex(10));
    }

    #[test]
    fn test_append_rejects_previous_index_beyond_log() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        seed_commands(&ctx, Term(1), 3);

        let response = on_server_task(ctx.server_id(), || {
            role.append(
                &mut ctx,
                append_request(1, "a", 8, 1, vec![command_at(9, 1, "set x 1")], 9),
            )
            .unwrap()
        });

        assert!(!response.succeeded);
        assert_eq!(response.log_index, LogIndex(3));
    }

    #[test]
    fn test_append_materializes_only_committed_entries() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        seed_commands(&ctx, Term(3), 5);
        on_server_task(ctx.server_id(), || {
            ctx.set_term(Term(3)).unwrap();
            ctx.set_commit_index(LogIndex(5));
        });

        let entries = vec![
            command_at(6, 3, "set x 6"),
            command_at(7, 3, "set y 7"),
            command_at(8, 3, "set z 8"),
        ];
        let response = on_server_task(ctx.server_id(), || {
            role.append(&mut ctx, append_request(3, "a", 5, 3, entries, 7))
                .unwrap()
        });

        assert!(response.succeeded);
        assert_eq!(response.log_index, LogIndex(8));
        // Entries 6 and 7 are committed and written; 8 stays out of the log.
        assert_eq!(ctx.log().last_index(), LogIndex(7));
        assert_eq!(ctx.commit_index(), LogIndex(7));
        assert_eq!(ctx.last_applied(), LogIndex(7));
    }

    #[test]
    fn test_append_redelivery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        seed_commands(&ctx, Term(3), 5);
        on_server_task(ctx.server_id(), || {
            ctx.set_term(Term(3)).unwrap();
            ctx.set_commit_index(LogIndex(5));
        });

        let request = append_request(
            3,
            "a",
            5,
            3,
            vec![command_at(6, 3, "set x 6"), command_at(7, 3, "set y 7")],
            7,
        );

        let first = on_server_task(ctx.server_id(), || role.append(&mut ctx, request.clone()).unwrap());
        let second = on_server_task(ctx.server_id(), || role.append(&mut ctx, request).unwrap());

        assert_eq!(first, second);
        assert_eq!(ctx.log().last_index(), LogIndex(7));
        assert_eq!(ctx.last_applied(), LogIndex(7));
    }

    #[test]
    fn test_empty_append_advances_commit_index() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        seed_commands(&ctx, Term(2), 6);

        let response = on_server_task(ctx.server_id(), || {
            role.append(&mut ctx, append_request(2, "a", 6, 2, Vec::new(), 9))
                .unwrap()
        });

        assert!(response.succeeded);
        // The commit index is capped by the request's previous index.
        assert_eq!(ctx.commit_index(), LogIndex(6));
    }

    #[test]
    fn test_open_truncates_uncommitted_entries() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);

        seed_commands(&ctx, Term(2), 15);
        on_server_task(ctx.server_id(), || {
            ctx.set_commit_index(LogIndex(12));
        });

        let mut role = PassiveRole::new();
        on_server_task(ctx.server_id(), || role.open(&mut ctx).unwrap());

        assert_eq!(ctx.log().last_index(), LogIndex(12));
    }

    #[test]
    fn test_install_happy_path_across_chunks() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        let first = on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 42, 100, 0, &[0x01, 0x02], false))
                .unwrap()
        });
        assert_eq!(first, InstallResponse::ok());
        assert_eq!(role.next_snapshot_offset(), 1);

        let second = on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 42, 100, 1, &[0x03], true))
                .unwrap()
        });
        assert_eq!(second, InstallResponse::ok());
        assert_eq!(role.pending_count(), 0);
        assert_eq!(role.next_snapshot_offset(), 0);

        let snapshot = ctx.snapshots().get_snapshot(42).unwrap();
        assert_eq!(snapshot.index(), 100);
        assert_eq!(snapshot.status(), SnapshotStatus::Complete);
        assert_eq!(snapshot.read().unwrap(), Bytes::from_static(&[0x01, 0x02, 0x03]));
    }

    #[test]
    fn test_install_rejects_offset_gap() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 7, 50, 0, &[0xAA], false))
                .unwrap()
        });

        let response = on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 7, 50, 2, &[0xBB], false))
                .unwrap()
        });
        assert_eq!(
            response,
            InstallResponse::error(ErrorKind::IllegalMemberState)
        );
        // The pending install survives and still expects chunk 1.
        assert_eq!(role.pending_count(), 1);
        assert_eq!(role.next_snapshot_offset(), 1);
    }

    #[test]
    fn test_install_first_chunk_must_start_at_zero() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        let response = on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 7, 50, 3, &[0xAA], false))
                .unwrap()
        });
        assert_eq!(
            response,
            InstallResponse::error(ErrorKind::IllegalMemberState)
        );
    }

    #[test]
    fn test_install_duplicate_chunk_is_acknowledged_without_rewrite() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 9, 60, 0, &[0x01], false))
                .unwrap();
            // The sender never saw our ack and retries chunk 0.
            let dup = role
                .install(&mut ctx, install_request(1, 9, 60, 0, &[0x01], false))
                .unwrap();
            assert_eq!(dup, InstallResponse::ok());

            role.install(&mut ctx, install_request(1, 9, 60, 1, &[0x02], true))
                .unwrap();
        });

        let snapshot = ctx.snapshots().get_snapshot(9).unwrap();
        assert_eq!(snapshot.read().unwrap(), Bytes::from_static(&[0x01, 0x02]));
    }

    #[test]
    fn test_install_duplicate_final_chunk_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 9, 60, 0, &[0x01, 0x02], true))
                .unwrap();
            let replay = role
                .install(&mut ctx, install_request(1, 9, 60, 0, &[0x01, 0x02], true))
                .unwrap();
            assert_eq!(replay, InstallResponse::ok());
        });

        let snapshot = ctx.snapshots().get_snapshot(9).unwrap();
        assert_eq!(snapshot.read().unwrap(), Bytes::from_static(&[0x01, 0x02]));
    }

    #[test]
    fn test_install_index_mismatch_discards_stale_pending() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 5, 100, 0, &[0x01], false))
                .unwrap();
            // The leader moved the snapshot point; the old install is stale.
            let response = role
                .install(&mut ctx, install_request(1, 5, 120, 0, &[0x09], false))
                .unwrap();
            assert_eq!(response, InstallResponse::ok());
        });

        assert_eq!(role.pending_count(), 1);
        assert_eq!(role.next_snapshot_offset(), 1);
    }

    #[test]
    fn test_install_rejects_stale_term() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            ctx.set_term(Term(4)).unwrap();
            let response = role
                .install(&mut ctx, install_request(2, 1, 10, 0, &[0x01], false))
                .unwrap();
            assert_eq!(
                response,
                InstallResponse::error(ErrorKind::IllegalMemberState)
            );
        });
    }

    #[test]
    fn test_close_discards_pending_snapshots() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            role.install(&mut ctx, install_request(1, 3, 30, 0, &[0x01], false))
                .unwrap();
        });
        assert_eq!(role.pending_count(), 1);

        role.close(&mut ctx);
        assert_eq!(role.pending_count(), 0);
        assert!(ctx.snapshots().get_snapshot(3).is_none());
    }

    #[test]
    fn test_sequential_query_forwarded_when_session_unseen() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        seed_commands(&ctx, Term(1), 9);
        on_server_task(ctx.server_id(), || {
            ctx.set_commit_index(LogIndex(9));
            let mut reader = ctx.log().reader();
            ctx.executor().apply_all(&mut reader, LogIndex(9)).unwrap();
            ctx.set_leader(Some(NodeId::new("a")));
        });

        let request = QueryRequest {
            session: 20,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Sequential,
            bytes: Bytes::from("get k1"),
        };
        let action = on_server_task(ctx.server_id(), || role.query(&mut ctx, request).unwrap());

        match action {
            QueryAction::Forward(target, _) => assert_eq!(target, NodeId::new("a")),
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_sequential_query_without_leader_is_no_leader() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        let request = QueryRequest {
            session: 20,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Sequential,
            bytes: Bytes::from("get k1"),
        };
        let action = on_server_task(ctx.server_id(), || role.query(&mut ctx, request).unwrap());

        match action {
            QueryAction::Respond(response) => {
                assert_eq!(response.status, ResponseStatus::Error);
                assert_eq!(response.error, Some(ErrorKind::NoLeader));
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn test_sequential_query_served_locally_when_caught_up() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        seed_commands(&ctx, Term(1), 5);
        on_server_task(ctx.server_id(), || {
            ctx.set_commit_index(LogIndex(5));
            let mut reader = ctx.log().reader();
            ctx.executor().apply_all(&mut reader, LogIndex(5)).unwrap();
        });

        let request = QueryRequest {
            session: 3,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Sequential,
            bytes: Bytes::from("get k4"),
        };
        let action = on_server_task(ctx.server_id(), || role.query(&mut ctx, request).unwrap());

        match action {
            QueryAction::Respond(response) => {
                assert_eq!(response.status, ResponseStatus::Ok);
                assert_eq!(response.result, Some(Bytes::from("4")));
                assert_eq!(response.index, LogIndex(5));
            }
            other => panic!("expected a local response, got {other:?}"),
        }
    }

    #[test]
    fn test_linearizable_query_always_forwarded() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        on_server_task(ctx.server_id(), || {
            ctx.set_leader(Some(NodeId::new("b")));
        });

        let request = QueryRequest {
            session: 0,
            sequence: 1,
            index: LogIndex::ZERO,
            consistency: ConsistencyLevel::Linearizable,
            bytes: Bytes::from("get k1"),
        };
        let action = on_server_task(ctx.server_id(), || role.query(&mut ctx, request).unwrap());

        assert!(matches!(action, QueryAction::Forward(target, _) if target == NodeId::new("b")));
    }

    #[test]
    fn test_passive_cannot_vote() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        let request = VoteRequest {
            term: Term(2),
            candidate: NodeId::new("a"),
            last_log_index: LogIndex(10),
            last_log_term: Term(1),
        };
        let response = on_server_task(ctx.server_id(), || role.vote(&mut ctx, request).unwrap());

        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error, Some(ErrorKind::IllegalMemberState));
        // The higher term is still adopted.
        assert_eq!(ctx.term(), Term(2));
    }

    #[test]
    fn test_append_with_higher_term_adopts_term_and_leader() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), &["s", "a", "b"]);
        let mut role = PassiveRole::new();

        let response = on_server_task(ctx.server_id(), || {
            role.append(&mut ctx, append_request(7, "b", 0, 0, Vec::new(), 0))
                .unwrap()
        });

        assert!(response.succeeded);
        assert_eq!(ctx.term(), Term(7));
        assert_eq!(ctx.leader(), Some(&NodeId::new("b")));
        // Non-voting members adopt the term without changing role.
        assert!(ctx.take_transition().is_none());
    }
}
