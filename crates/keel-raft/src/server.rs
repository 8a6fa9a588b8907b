//! The server actor.
//!
//! One task owns the [`ServerContext`] and the current role; every external
//! entry point posts a [`ServerMessage`] into the mailbox and awaits a
//! oneshot reply. This is the single-thread execution contract: handlers
//! run to completion on the server task, and the only work that leaves it is
//! network I/O (forwards, replication sends, vote solicitation), which
//! re-enters through the mailbox or completes the caller's oneshot directly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keel_observe::{Meter, NoopMeter};
use keel_storage::{LogConfig, MetaStore, SegmentedLog, SnapshotStore};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::RaftConfig;
use crate::context::{ServerContext, SERVER_TASK};
use crate::error::{ErrorKind, RaftError, Result};
use crate::executor::{StateMachine, StateMachineExecutor};
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, InstallRequest,
    InstallResponse, QueryRequest, QueryResponse, VoteRequest, VoteResponse,
};
use crate::roles::{CommandAction, QueryAction, RoleState};
use crate::transport::RaftTransport;
use crate::types::{LogIndex, NodeId, Role, Term};

/// Everything that can land in a server's mailbox.
pub enum ServerMessage {
    Append {
        request: AppendRequest,
        responder: oneshot::Sender<AppendResponse>,
    },
    Vote {
        request: VoteRequest,
        responder: oneshot::Sender<VoteResponse>,
    },
    Install {
        request: InstallRequest,
        responder: oneshot::Sender<InstallResponse>,
    },
    Query {
        request: QueryRequest,
        responder: oneshot::Sender<QueryResponse>,
    },
    Command {
        request: CommandRequest,
        responder: oneshot::Sender<CommandResponse>,
    },
    /// A follower's reply to our replication round.
    AppendResult {
        peer: NodeId,
        sent_term: Term,
        response: AppendResponse,
    },
    /// A peer's reply to our vote solicitation.
    VoteResult {
        peer: NodeId,
        sent_term: Term,
        response: VoteResponse,
    },
    /// Snapshot of observable server state, for tests and operators.
    Inspect {
        responder: oneshot::Sender<ServerStatus>,
    },
    Shutdown,
}

/// Observable server state at one quiescent point.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_index: LogIndex,
}

/// Clonable handle posting requests into a server's mailbox.
#[derive(Clone)]
pub struct RaftServerHandle {
    tx: mpsc::Sender<ServerMessage>,
}

impl RaftServerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ServerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| RaftError::Closed)?;
        rx.await.map_err(|_| RaftError::Closed)
    }

    pub async fn append(&self, request: AppendRequest) -> Result<AppendResponse> {
        self.request(|responder| ServerMessage::Append { request, responder })
            .await
    }

    pub async fn vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.request(|responder| ServerMessage::Vote { request, responder })
            .await
    }

    pub async fn install(&self, request: InstallRequest) -> Result<InstallResponse> {
        self.request(|responder| ServerMessage::Install { request, responder })
            .await
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.request(|responder| ServerMessage::Query { request, responder })
            .await
    }

    pub async fn command(&self, request: CommandRequest) -> Result<CommandResponse> {
        self.request(|responder| ServerMessage::Command { request, responder })
            .await
    }

    pub async fn status(&self) -> Result<ServerStatus> {
        self.request(|responder| ServerMessage::Inspect { responder })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ServerMessage::Shutdown).await;
    }
}

/// A single consensus server: context, role state, and the actor loop.
pub struct RaftServer {
    ctx: ServerContext,
    role: RoleState,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    rx: mpsc::Receiver<ServerMessage>,
    tx: mpsc::Sender<ServerMessage>,
    election_timeout: Duration,
}

impl RaftServer {
    /// Creates a server rooted at `data_dir`, opening (or recovering) its
    /// log, snapshot and metadata stores.
    pub fn new(
        node_id: NodeId,
        members: Vec<NodeId>,
        data_dir: &Path,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        initial_role: Role,
        config: RaftConfig,
    ) -> Result<(Self, RaftServerHandle)> {
        Self::new_with_meter(
            node_id,
            members,
            data_dir,
            machine,
            transport,
            initial_role,
            config,
            Arc::new(NoopMeter),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_meter(
        node_id: NodeId,
        members: Vec<NodeId>,
        data_dir: &Path,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        initial_role: Role,
        config: RaftConfig,
        meter: Arc<dyn Meter>,
    ) -> Result<(Self, RaftServerHandle)> {
        config
            .validate()
            .map_err(|e| RaftError::Config {
                reason: e.to_string(),
            })?;

        let node_ord = members.iter().position(|m| m == &node_id).unwrap_or(0) as u32;
        let (log, recovery) = SegmentedLog::open_with_meter(
            LogConfig {
                dir: data_dir.join("log"),
                node_id: node_ord,
                ..Default::default()
            },
            meter.clone(),
        )?;
        if recovery.corruption_detected {
            tracing::warn!(
                entries = recovery.entries_recovered,
                "log recovered with corruption; tail was truncated"
            );
        }
        let snapshots = SnapshotStore::open_with_meter(
            data_dir.join("snapshots"),
            meter.clone(),
            node_ord,
        )?;
        let meta = MetaStore::open(data_dir.join("meta"))?;
        let executor = StateMachineExecutor::new(machine);

        let ctx = ServerContext::new(
            node_id, members, log, snapshots, meta, executor, meter,
        )?;

        let (tx, rx) = mpsc::channel(1024);
        let election_timeout = config.random_election_timeout();
        let handle = RaftServerHandle { tx: tx.clone() };

        Ok((
            Self {
                ctx,
                role: RoleState::new(initial_role),
                config,
                transport,
                rx,
                tx,
                election_timeout,
            },
            handle,
        ))
    }

    /// Creates a server from a loaded [`ServerConfig`]: membership, storage
    /// directories and tuning all come from the configuration surface.
    pub fn from_config(
        config: &crate::config::ServerConfig,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        initial_role: Role,
    ) -> Result<(Self, RaftServerHandle)> {
        config.validate().map_err(|e| RaftError::Config {
            reason: e.to_string(),
        })?;
        Self::new(
            NodeId::new(config.node_id.clone()),
            config.member_ids(),
            &config.data_dir,
            machine,
            transport,
            initial_role,
            config.raft.clone(),
        )
    }

    /// Runs the server until shutdown. Consumes the server; the owning task
    /// is the only place context state is ever touched.
    pub async fn run(mut self) -> Result<()> {
        let server_id = self.ctx.server_id();
        SERVER_TASK
            .scope(server_id, async move { self.event_loop().await })
            .await
    }

    async fn event_loop(&mut self) -> Result<()> {
        if let Err(e) = self.role.open(&mut self.ctx) {
            tracing::error!(error = %e, "failed to open initial role");
            return Err(e);
        }
        self.after_transition();
        self.apply_transitions();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.election_deadline();
            let sleep_until = deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(ServerMessage::Shutdown) | None => break,
                        Some(message) => self.handle_message(message),
                    }
                }
                _ = heartbeat.tick(), if self.role.role() == Role::Leader => {
                    self.broadcast_append();
                }
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    self.handle_election_timeout();
                }
            }

            self.apply_transitions();
        }

        self.role.close(&mut self.ctx);
        Ok(())
    }

    /// The next election deadline, when this role runs elections at all.
    fn election_deadline(&self) -> Option<tokio::time::Instant> {
        match self.role.role() {
            Role::Follower | Role::Candidate => Some(tokio::time::Instant::from_std(
                self.ctx.last_leader_contact() + self.election_timeout,
            )),
            _ => None,
        }
    }

    fn handle_election_timeout(&mut self) {
        tracing::debug!(
            role = %self.role.role(),
            term = %self.ctx.term(),
            "election timeout elapsed"
        );
        self.ctx.request_transition(Role::Candidate);
    }

    /// Performs requested role changes until the state settles.
    fn apply_transitions(&mut self) {
        while let Some(next) = self.ctx.take_transition() {
            self.role.close(&mut self.ctx);
            self.role = RoleState::new(next);
            if let Err(e) = self.role.open(&mut self.ctx) {
                tracing::error!(role = %next, error = %e, "failed to open role, quiescing");
                self.role = RoleState::new(Role::Reserve);
                let _ = self.role.open(&mut self.ctx);
                break;
            }
            self.after_transition();
        }
    }

    fn after_transition(&mut self) {
        self.election_timeout = self.config.random_election_timeout();
        match self.role.role() {
            Role::Candidate => self.solicit_votes(),
            Role::Leader => self.broadcast_append(),
            _ => {}
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Append { request, responder } => {
                let response = self.role.append(&mut self.ctx, request).unwrap_or_else(|e| {
                    self.note_failure(&e, "append");
                    AppendResponse::error(self.ctx.term(), self.ctx.log().last_index(), e.kind())
                });
                let _ = responder.send(response);
            }
            ServerMessage::Vote { request, responder } => {
                let response = self.role.vote(&mut self.ctx, request).unwrap_or_else(|e| {
                    self.note_failure(&e, "vote");
                    VoteResponse::error(self.ctx.term(), e.kind())
                });
                let _ = responder.send(response);
            }
            ServerMessage::Install { request, responder } => {
                let response = self
                    .role
                    .install(&mut self.ctx, request)
                    .unwrap_or_else(|e| {
                        self.note_failure(&e, "install");
                        InstallResponse::error(e.kind())
                    });
                let _ = responder.send(response);
            }
            ServerMessage::Query { request, responder } => {
                match self.role.query(&mut self.ctx, request) {
                    Ok(QueryAction::Respond(response)) => {
                        let _ = responder.send(response);
                    }
                    Ok(QueryAction::Forward(target, request)) => {
                        self.forward_query(target, request, responder);
                    }
                    Err(e) => {
                        self.note_failure(&e, "query");
                        let _ = responder.send(QueryResponse::error(e.kind()));
                    }
                }
            }
            ServerMessage::Command { request, responder } => {
                match self.role.command(&mut self.ctx, request) {
                    Ok(CommandAction::Respond(response)) => {
                        let _ = responder.send(response);
                    }
                    Ok(CommandAction::Forward(target, request)) => {
                        self.forward_command(target, request, responder);
                    }
                    Ok(CommandAction::Wait(rx)) => {
                        tokio::spawn(async move {
                            let response = match rx.await {
                                Ok(outcome) => crate::roles::common::command_response(outcome),
                                // The entry was truncated away before it
                                // committed (leadership changed).
                                Err(_) => CommandResponse::error(ErrorKind::CommandFailure),
                            };
                            let _ = responder.send(response);
                        });
                        // Replicate the new entry without waiting for the
                        // next heartbeat tick.
                        self.broadcast_append();
                    }
                    Err(e) => {
                        self.note_failure(&e, "command");
                        let _ = responder.send(CommandResponse::error(e.kind()));
                    }
                }
            }
            ServerMessage::AppendResult {
                peer,
                sent_term,
                response,
            } => {
                if let RoleState::Leader(leader) = &mut self.role {
                    if let Err(e) =
                        leader.handle_append_result(&mut self.ctx, peer, sent_term, &response)
                    {
                        self.note_failure(&e, "replication");
                    }
                }
            }
            ServerMessage::VoteResult {
                peer,
                sent_term,
                response,
            } => {
                if let RoleState::Candidate(candidate) = &mut self.role {
                    if sent_term == self.ctx.term() {
                        if let Err(e) = candidate.record_vote(&mut self.ctx, peer, &response) {
                            self.note_failure(&e, "election");
                        }
                    }
                }
            }
            ServerMessage::Inspect { responder } => {
                let _ = responder.send(ServerStatus {
                    role: self.role.role(),
                    term: self.ctx.term(),
                    leader: self.ctx.leader().cloned(),
                    commit_index: self.ctx.commit_index(),
                    last_applied: self.ctx.last_applied(),
                    last_index: self.ctx.log().last_index(),
                });
            }
            ServerMessage::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    /// Storage failures poison the role; quiesce rather than serve wrong
    /// answers. Everything else is translated into the response and logged.
    fn note_failure(&mut self, error: &RaftError, during: &str) {
        if error.is_fatal() {
            tracing::error!(error = %error, during, "storage failure, stepping into reserve");
            self.ctx.request_transition(Role::Reserve);
        } else {
            tracing::debug!(error = %error, during, "request failed");
        }
    }

    fn forward_query(
        &self,
        target: NodeId,
        request: QueryRequest,
        responder: oneshot::Sender<QueryResponse>,
    ) {
        let transport = self.transport.clone();
        let timeout = self.config.forward_timeout;
        tokio::spawn(async move {
            let response =
                match tokio::time::timeout(timeout, transport.query(&target, request)).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) | Err(_) => QueryResponse::error(ErrorKind::NoLeader),
                };
            let _ = responder.send(response);
        });
    }

    fn forward_command(
        &self,
        target: NodeId,
        request: CommandRequest,
        responder: oneshot::Sender<CommandResponse>,
    ) {
        let transport = self.transport.clone();
        let timeout = self.config.forward_timeout;
        tokio::spawn(async move {
            let response =
                match tokio::time::timeout(timeout, transport.command(&target, request)).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) | Err(_) => CommandResponse::error(ErrorKind::NoLeader),
                };
            let _ = responder.send(response);
        });
    }

    /// Sends one replication round to every peer. Responses re-enter the
    /// mailbox as `AppendResult` messages.
    fn broadcast_append(&mut self) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };
        let sent_term = self.ctx.term();

        for peer in self.ctx.peers() {
            let request = match leader.prepare_append(
                &self.ctx,
                &peer,
                self.config.max_entries_per_append,
            ) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "failed to build append request");
                    continue;
                }
            };

            let transport = self.transport.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                if let Ok(response) = transport.append(&peer, request).await {
                    let _ = tx
                        .send(ServerMessage::AppendResult {
                            peer,
                            sent_term,
                            response,
                        })
                        .await;
                }
            });
        }
    }

    /// Asks every peer for a vote. Responses re-enter the mailbox as
    /// `VoteResult` messages.
    fn solicit_votes(&mut self) {
        let sent_term = self.ctx.term();
        let last_log_index = self.ctx.log().last_index();
        let mut reader = self.ctx.log().reader();
        let last_log_term = match reader.last_term() {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "cannot read last log term for election");
                return;
            }
        };

        for peer in self.ctx.peers() {
            let request = VoteRequest {
                term: sent_term,
                candidate: self.ctx.node_id().clone(),
                last_log_index,
                last_log_term,
            };
            let transport = self.transport.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                if let Ok(response) = transport.vote(&peer, request).await {
                    let _ = tx
                        .send(ServerMessage::VoteResult {
                            peer,
                            sent_term,
                            response,
                        })
                        .await;
                }
            });
        }
    }
}
