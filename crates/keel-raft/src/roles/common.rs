//! Handler fragments shared across roles.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use keel_storage::Snapshot;

use crate::context::ServerContext;
use crate::error::{ErrorKind, Result};
use crate::executor::OperationResult;
use crate::protocol::{
    AppendRequest, AppendResponse, CommandResponse, InstallRequest, InstallResponse,
    QueryRequest, QueryResponse,
};
use crate::roles::QueryAction;
use crate::types::{ConsistencyLevel, LogIndex, NodeId, Role, Term};

/// Current wall clock in milliseconds, for stamping into entries.
///
/// This is the only place the consensus layer reads the clock for state
/// machine purposes; the value travels inside the entry so every server
/// applies the same one.
pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Adopts a higher term and records the sender as leader when appropriate.
///
/// Voting roles step down to follower on a strictly greater term; the
/// non-voting roles keep their role, only their term moves.
pub(crate) fn update_term_and_leader(
    ctx: &mut ServerContext,
    term: Term,
    leader: Option<NodeId>,
) -> Result<()> {
    if term > ctx.term() {
        ctx.set_term(term)?;
        if matches!(ctx.role(), Role::Candidate | Role::Leader) {
            ctx.request_transition(Role::Follower);
        }
    }
    if term == ctx.term() {
        if let Some(leader) = leader {
            ctx.set_leader(Some(leader));
            ctx.touch_leader_contact();
        }
    }
    Ok(())
}

/// Discards entries above the commit index. Run when a non-voting role
/// opens: a server that cannot vote must not retain speculative tail
/// entries that could later conflict with the leader's canonical log.
pub(crate) fn truncate_uncommitted(ctx: &mut ServerContext) -> Result<()> {
    let commit = ctx.commit_index();
    let writer = ctx.log().writer();
    let mut guard = writer.lock();
    guard.truncate(commit)?;
    Ok(())
}

/// The append-entries contract shared by every replica role.
///
/// With `commit_only` set (the passive path) only entries at or below the
/// new commit index are materialized; otherwise the whole batch is written.
/// Either way, conflicting entries (same index, different term) force a
/// truncation of the tail before the replacement is appended.
pub(crate) fn handle_append(
    ctx: &mut ServerContext,
    request: &AppendRequest,
    commit_only: bool,
) -> Result<AppendResponse> {
    let term = ctx.term();

    // A stale leader learns the new term from the rejection and steps down.
    if request.term < term {
        tracing::debug!(
            request_term = %request.term,
            term = %term,
            "rejected append: request term below current term"
        );
        return Ok(AppendResponse::rejected(term, ctx.log().last_index()));
    }

    // The previous entry must exist here; if not, the leader decrements and
    // retries from further back.
    let last_index = ctx.log().last_index();
    if request.log_index != LogIndex::ZERO && request.log_index > last_index {
        tracing::debug!(
            prev = %request.log_index,
            last = %last_index,
            "rejected append: previous index beyond local log"
        );
        return Ok(AppendResponse::rejected(term, last_index));
    }

    // Voting replicas also verify the previous entry's term. Passive servers
    // hold only committed entries, which cannot conflict.
    if !commit_only && request.log_index != LogIndex::ZERO {
        let mut reader = ctx.log().reader();
        match reader.get(request.log_index)? {
            Some(prev) if prev.term == request.log_term => {}
            Some(prev) => {
                debug_assert!(
                    request.log_index > ctx.commit_index(),
                    "conflict at or below commit index"
                );
                tracing::debug!(
                    prev = %request.log_index,
                    local_term = %prev.term,
                    leader_term = %request.log_term,
                    "rejected append: previous entry term conflict, truncating"
                );
                let writer = ctx.log().writer();
                let mut guard = writer.lock();
                guard.truncate(request.log_index.prev().unwrap_or(LogIndex::ZERO))?;
                drop(guard);
                return Ok(AppendResponse::rejected(term, ctx.log().last_index()));
            }
            None => {
                return Ok(AppendResponse::rejected(term, last_index));
            }
        }
    }

    let last_entry_index = request
        .entries
        .last()
        .map(|e| e.index)
        .unwrap_or(request.log_index);

    // Never advance the commit index past the last entry this request covers.
    let new_commit = ctx
        .commit_index()
        .max(request.commit_index.min(last_entry_index));

    if !request.entries.is_empty() {
        let writer = ctx.log().writer();
        let mut guard = writer.lock();
        let mut reader = ctx.log().reader();

        for entry in &request.entries {
            // Passive servers materialize only committed data.
            if commit_only && entry.index > new_commit {
                break;
            }

            match reader.get(entry.index)? {
                // Same (index, term): already consistent, nothing to write.
                Some(existing) if existing.term == entry.term => {}
                Some(_) => {
                    guard.truncate(entry.index.prev().unwrap_or(LogIndex::ZERO))?;
                    guard.append_indexed(entry.clone())?;
                    tracing::debug!(index = %entry.index, term = %entry.term, "overwrote conflicting entry");
                }
                None => {
                    guard.append_indexed(entry.clone())?;
                }
            }
        }
    }

    ctx.set_commit_index(new_commit);

    let commit = ctx.commit_index();
    let mut reader = ctx.log().reader();
    ctx.executor().apply_all(&mut reader, commit)?;
    ctx.assert_invariants();

    Ok(AppendResponse::succeeded(term, last_entry_index))
}

/// In-flight snapshot installs, held by the roles that accept them.
///
/// `next_offset` tracks the single active install; this is safe because an
/// index mismatch discards any stale pending snapshot before a new install
/// begins, so at most one install is in flight at a time.
pub(crate) struct PendingSnapshots {
    snapshots: HashMap<u64, Snapshot>,
    next_offset: u32,
}

impl PendingSnapshots {
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
            next_offset: 0,
        }
    }

    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn contains(&self, id: u64) -> bool {
        self.snapshots.contains_key(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Closes and deletes every pending snapshot. Run on role close.
    pub fn discard_all(&mut self) {
        for (id, snapshot) in self.snapshots.drain() {
            snapshot.close();
            if let Err(e) = snapshot.delete() {
                tracing::warn!(id, error = %e, "failed to delete pending snapshot");
            }
        }
        self.next_offset = 0;
    }
}

/// The chunked snapshot-install contract shared by passive and follower.
pub(crate) fn handle_install(
    ctx: &mut ServerContext,
    pending: &mut PendingSnapshots,
    request: &InstallRequest,
) -> Result<InstallResponse> {
    if request.term < ctx.term() {
        return Ok(InstallResponse::error(ErrorKind::IllegalMemberState));
    }

    // A re-delivered final chunk for a snapshot that already completed is
    // acknowledged idempotently.
    if request.complete && !pending.contains(request.id) {
        if let Some(existing) = ctx.snapshots().get_snapshot(request.id) {
            if existing.index() == request.index.as_u64() {
                return Ok(InstallResponse::ok());
            }
        }
    }

    // An in-flight install at a different index is stale: the leader dictates
    // where snapshots go, so drop ours and follow.
    let mut snapshot = pending.snapshots.get(&request.id).cloned();
    if let Some(ref stale) = snapshot {
        if stale.index() != request.index.as_u64() {
            stale.close();
            stale.delete()?;
            pending.snapshots.remove(&request.id);
            pending.next_offset = 0;
            snapshot = None;
        }
    }

    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => {
            // A new install must start at chunk 0.
            if request.offset > 0 {
                return Ok(InstallResponse::error(ErrorKind::IllegalMemberState));
            }
            let created = ctx
                .snapshots()
                .create_snapshot(request.id, request.index.as_u64())?;
            pending.snapshots.insert(request.id, created.clone());
            pending.next_offset = 0;
            created
        }
    };

    // Replayed chunks are acknowledged without writing twice.
    if request.offset < pending.next_offset {
        return Ok(InstallResponse::ok());
    }
    if request.offset > pending.next_offset {
        return Ok(InstallResponse::error(ErrorKind::IllegalMemberState));
    }

    {
        let mut writer = snapshot.writer()?;
        writer.write(&request.data)?;
    }

    if request.complete {
        snapshot.persist()?;
        snapshot.complete()?;
        pending.snapshots.remove(&request.id);
        pending.next_offset = 0;
    } else {
        pending.next_offset += 1;
    }

    Ok(InstallResponse::ok())
}

/// The query contract for servers that cannot serve linearizable reads.
///
/// Sequential queries are served locally only when this server has applied
/// the client's session registration and its log is not behind its own
/// commit pointer; everything else is forwarded to the leader.
pub(crate) fn handle_query(
    ctx: &mut ServerContext,
    request: QueryRequest,
) -> Result<QueryAction> {
    if request.consistency != ConsistencyLevel::Sequential {
        return Ok(forward_query(ctx, request));
    }

    // The session registration entry must have been applied here, or the
    // server could wrongly tell the client its session does not exist.
    if ctx.last_applied() < LogIndex(request.session) {
        tracing::trace!(
            session = request.session,
            last_applied = %ctx.last_applied(),
            "state out of sync, forwarding query to leader"
        );
        return Ok(forward_query(ctx, request));
    }

    // A log behind its own commit pointer has fallen too far behind to read.
    if ctx.log().last_index() < ctx.commit_index() {
        tracing::trace!("log behind commit index, forwarding query to leader");
        return Ok(forward_query(ctx, request));
    }

    Ok(QueryAction::Respond(apply_query(ctx, &request)))
}

/// Runs a query against the local state machine.
pub(crate) fn apply_query(ctx: &mut ServerContext, request: &QueryRequest) -> QueryResponse {
    let timestamp_ms = wall_clock_ms();
    let outcome = ctx.executor().apply_query(
        timestamp_ms,
        request.session,
        request.sequence,
        &request.bytes,
    );
    query_response(outcome)
}

pub(crate) fn forward_query(ctx: &ServerContext, request: QueryRequest) -> QueryAction {
    match ctx.leader() {
        Some(leader) => QueryAction::Forward(leader.clone(), request),
        None => QueryAction::Respond(QueryResponse::error(ErrorKind::NoLeader)),
    }
}

pub(crate) fn query_response(outcome: OperationResult) -> QueryResponse {
    match outcome.result {
        Ok(bytes) => QueryResponse::ok(outcome.index, outcome.event_index, bytes),
        Err(kind) => QueryResponse::error_at(outcome.index, outcome.event_index, kind),
    }
}

pub(crate) fn command_response(outcome: OperationResult) -> CommandResponse {
    match outcome.result {
        Ok(bytes) => CommandResponse::ok(outcome.index, outcome.event_index, bytes),
        Err(kind) => CommandResponse::error_at(outcome.index, outcome.event_index, kind),
    }
}

/// The vote contract for voting roles.
///
/// Grants iff the candidate's term is current, this server has not voted for
/// anyone else this term, and the candidate's log is at least as up to date.
pub(crate) fn handle_vote(
    ctx: &mut ServerContext,
    request: &crate::protocol::VoteRequest,
) -> Result<crate::protocol::VoteResponse> {
    use crate::protocol::VoteResponse;

    if request.term < ctx.term() {
        return Ok(VoteResponse::denied(ctx.term()));
    }

    let already_voted = ctx
        .voted_for()
        .map_or(false, |voted| voted != &request.candidate);
    if already_voted {
        return Ok(VoteResponse::denied(ctx.term()));
    }

    let last_index = ctx.log().last_index();
    let mut reader = ctx.log().reader();
    let last_term = reader.last_term()?;

    let log_ok = request.last_log_term > last_term
        || (request.last_log_term == last_term && request.last_log_index >= last_index);
    if !log_ok {
        tracing::debug!(
            candidate = %request.candidate,
            "denied vote: candidate log not up to date"
        );
        return Ok(VoteResponse::denied(ctx.term()));
    }

    ctx.vote_for(request.candidate.clone())?;
    ctx.touch_leader_contact();
    tracing::debug!(candidate = %request.candidate, term = %ctx.term(), "granted vote");
    Ok(VoteResponse::granted(ctx.term()))
}
