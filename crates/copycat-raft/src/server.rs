//! The Raft Server
//!
//! One server = one event-loop task owning a [`ServerContext`]. Everything —
//! RPC handling, timer expirations, replication completions, compaction —
//! runs on that task, so no state is ever locked. I/O happens elsewhere:
//! sends are spawned onto the runtime and their completions are posted back
//! to the loop as events carrying the role epoch at which they were started.
//! A completion whose epoch no longer matches is stale and ignored; that is
//! the whole cancellation story.
//!
//! ## Roles
//!
//! - **Follower**: resets its election timer on valid appends; on expiry it
//!   pre-votes (polls) the active members and only becomes a candidate on
//!   quorum acceptance, so a partitioned server cannot inflate the term
//! - **Candidate**: bumps the term, votes for itself, solicits votes;
//!   restarts on a split vote, steps down on any valid append or higher term
//! - **Leader**: appends a no-op for its term, replicates with one
//!   outstanding append per peer, advances the commit index at quorum, and
//!   answers client sessions
//! - **Passive**: accepts appends and applies committed entries, refuses
//!   votes and polls; the role of a joining or demoted member
//!
//! A term only ever moves forward; observing a higher term from anyone
//! means stepping down to follower immediately.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use copycat_core::{
    Address, AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigureRequest,
    ConfigureResponse, Consistency, Entry, KeepAliveRequest, KeepAliveResponse, MembershipChange,
    Payload, PollRequest, PollResponse, QueryRequest, QueryResponse, RaftError, RegisterRequest,
    RegisterResponse, Request, Response, Status, VoteRequest, VoteResponse,
};
use copycat_storage::{Compactor, Log};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::apply::{ApplyOutcome, Executor, StateMachine};
use crate::cluster::Cluster;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::replicator::Replicator;
use crate::session::SessionManager;
use crate::state::ServerContext;
use crate::transport::Transport;

/// Replication batches are capped at this many bytes of entries.
const MAX_BATCH_SIZE: usize = 1024 * 1024;

/// The role a server is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
    Passive,
}

/// A point-in-time snapshot of a server's state, for operators and tests.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: u64,
    pub address: Address,
    pub role: RoleKind,
    pub term: u64,
    pub leader: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub segment_count: usize,
    pub sessions: usize,
    pub members: Vec<Address>,
}

/// Handle to a running Raft server.
pub struct RaftServer {
    address: Address,
    id: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl RaftServer {
    /// Open the log, bind the transport, and start the server task.
    pub async fn start(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<RaftServer> {
        config.validate()?;

        let address = config.address.clone();
        let id = address.id();
        let log = Log::open("copycat", config.storage.clone())?;
        let cluster = Cluster::new(
            address.clone(),
            config.members.clone(),
            config.passive.clone(),
        );
        let sessions = SessionManager::new(config.session_timeout.as_millis() as u64);
        let ctx = ServerContext::new(log, cluster, sessions);

        let mut listener = transport.bind(&address).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Pump incoming transport requests into the event loop.
        let rpc_tx = tx.clone();
        tokio::spawn(async move {
            while let Some((request, reply)) = listener.recv().await {
                if rpc_tx.send(Event::Rpc { request, reply }).is_err() {
                    break;
                }
            }
        });

        // Periodic compaction.
        let compact_tx = tx.clone();
        let compaction_interval = config.compaction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(compaction_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                if compact_tx.send(Event::Compact).is_err() {
                    break;
                }
            }
        });

        let task = ServerTask {
            id,
            local: address.clone(),
            config,
            ctx,
            executor: Executor::new(state_machine),
            role: Role::Passive,
            transport,
            compactor: Compactor::default(),
            tx: tx.clone(),
            rx,
            timer_seq: 0,
            role_epoch: 0,
            running: true,
        };
        tokio::spawn(task.run());

        Ok(RaftServer { address, id, tx })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot the server's current state.
    pub async fn status(&self) -> Result<ServerStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Event::Status { reply: reply_tx })
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)
    }

    /// Stop the server task. In-flight client requests receive errors.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Event::Shutdown { reply: reply_tx })
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)
    }
}

enum Event {
    Rpc {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    ElectionTimeout {
        seq: u64,
    },
    HeartbeatTick {
        epoch: u64,
    },
    PollReply {
        epoch: u64,
        response: Option<PollResponse>,
    },
    VoteReply {
        epoch: u64,
        response: Option<VoteResponse>,
    },
    AppendReply {
        epoch: u64,
        peer: u64,
        response: Option<AppendResponse>,
    },
    Compact,
    Status {
        reply: oneshot::Sender<ServerStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Tracks acceptance of a vote or poll round. The quorum size counts the
/// local server, which succeeds implicitly at creation time.
#[derive(Debug)]
struct VoteCount {
    quorum: usize,
    voters: usize,
    succeeded: usize,
    failed: usize,
    decided: bool,
}

impl VoteCount {
    /// A fresh count with the local server's own vote already recorded.
    fn with_self(quorum: usize, voters: usize) -> Self {
        let mut count = Self {
            quorum,
            voters,
            succeeded: 0,
            failed: 0,
            decided: quorum <= 1,
        };
        count.succeeded = 1;
        count
    }

    /// Record an acceptance. Returns `Some(true)` when the round succeeds.
    fn succeed(&mut self) -> Option<bool> {
        if self.decided {
            return None;
        }
        self.succeeded += 1;
        if self.succeeded >= self.quorum {
            self.decided = true;
            return Some(true);
        }
        None
    }

    /// Record a rejection. Returns `Some(false)` once success is impossible.
    fn fail(&mut self) -> Option<bool> {
        if self.decided {
            return None;
        }
        self.failed += 1;
        if self.voters - self.failed < self.quorum {
            self.decided = true;
            return Some(false);
        }
        None
    }
}

/// What a pending client operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Command,
    Register,
    KeepAlive,
    Configure,
}

struct PendingOp {
    kind: OpKind,
    reply: oneshot::Sender<Response>,
}

struct QueryWaiter {
    /// Wall time the quorum round was requested; answered once a quorum has
    /// acknowledged the leader at or after this instant.
    started: u64,
    request: QueryRequest,
    reply: oneshot::Sender<Response>,
}

struct FollowerState {
    polling: Option<VoteCount>,
}

struct CandidateState {
    epoch: u64,
    votes: VoteCount,
}

struct LeaderState {
    epoch: u64,
    replicator: Replicator,
    /// Client operations awaiting commitment, keyed by entry index.
    pending: BTreeMap<u64, PendingOp>,
    /// Strict queries awaiting a quorum round.
    query_waiters: Vec<QueryWaiter>,
    /// Index of the uncommitted configuration change, if one is in flight.
    configuring: Option<u64>,
    /// Dropping this cancels the heartbeat task.
    _heartbeat: oneshot::Sender<()>,
}

enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Passive,
}

impl Role {
    fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
            Role::Passive => RoleKind::Passive,
        }
    }
}

struct ServerTask {
    id: u64,
    local: Address,
    config: ServerConfig,
    ctx: ServerContext,
    executor: Executor,
    role: Role,
    transport: Arc<dyn Transport>,
    compactor: Compactor,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    /// Current election timer generation; expired generations are ignored.
    timer_seq: u64,
    /// Bumped on every role change; completions carry the epoch they were
    /// started under and are dropped when it no longer matches.
    role_epoch: u64,
    running: bool,
}

impl ServerTask {
    async fn run(mut self) {
        if self.ctx.cluster.is_local_active() {
            self.become_follower();
        } else {
            info!(address = %self.local, "not a voting member; starting passive and joining");
            self.role = Role::Passive;
            self.spawn_join_request();
        }

        while self.running {
            let Some(event) = self.rx.recv().await else {
                break;
            };
            if let Err(err) = self.handle_event(event) {
                // Storage failures are fatal: the server cannot continue
                // safely without its log.
                error!(address = %self.local, %err, "fatal error; halting server");
                self.running = false;
            }
        }
        info!(address = %self.local, "server stopped");
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Rpc { request, reply } => self.handle_rpc(request, reply),
            Event::ElectionTimeout { seq } => self.handle_election_timeout(seq),
            Event::HeartbeatTick { epoch } => self.handle_heartbeat_tick(epoch),
            Event::PollReply { epoch, response } => self.handle_poll_reply(epoch, response),
            Event::VoteReply { epoch, response } => self.handle_vote_reply(epoch, response),
            Event::AppendReply {
                epoch,
                peer,
                response,
            } => self.handle_append_reply(epoch, peer, response),
            Event::Compact => self.handle_compact(),
            Event::Status { reply } => {
                let _ = reply.send(self.status());
                Ok(())
            }
            Event::Shutdown { reply } => {
                self.cancel_role();
                self.running = false;
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.id,
            address: self.local.clone(),
            role: self.role.kind(),
            term: self.ctx.term,
            leader: self.ctx.leader,
            commit_index: self.ctx.commit_index,
            last_applied: self.ctx.last_applied,
            first_index: self.ctx.log.first_index(),
            last_index: self.ctx.log.last_index(),
            segment_count: self.ctx.log.segment_count(),
            sessions: self.ctx.sessions.len(),
            members: self.ctx.cluster.active_members().to_vec(),
        }
    }

    // ------------------------------------------------------------------
    // RPC dispatch
    // ------------------------------------------------------------------

    fn handle_rpc(&mut self, request: Request, reply: oneshot::Sender<Response>) -> Result<()> {
        match request {
            Request::Append(req) => {
                let response = self.handle_append(req)?;
                let _ = reply.send(Response::Append(response));
            }
            Request::Vote(req) => {
                let response = self.handle_vote(req)?;
                let _ = reply.send(Response::Vote(response));
            }
            Request::Poll(req) => {
                let response = self.handle_poll(req)?;
                let _ = reply.send(Response::Poll(response));
            }
            Request::Command(req) => self.handle_command(req, reply)?,
            Request::Query(req) => self.handle_query(req, reply)?,
            Request::Register(req) => self.handle_register(req, reply)?,
            Request::KeepAlive(req) => self.handle_keep_alive(req, reply)?,
            Request::Configure(req) => self.handle_configure(req, reply)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Append handling (all roles)
    // ------------------------------------------------------------------

    fn handle_append(&mut self, req: AppendRequest) -> Result<AppendResponse> {
        if req.term < self.ctx.term {
            return Ok(AppendResponse {
                status: Status::Ok,
                term: self.ctx.term,
                succeeded: false,
                log_index: self.ctx.log.last_index(),
            });
        }

        self.ctx.set_term(req.term);
        self.ctx.leader = Some(req.leader);
        if matches!(self.role, Role::Candidate(_) | Role::Leader(_)) {
            self.become_follower();
        } else if matches!(self.role, Role::Follower(_)) {
            self.reset_election_timer();
        }

        // Log consistency: the entry preceding the batch must match.
        if req.prev_log_index > 0 {
            let last = self.ctx.log.last_index();
            if req.prev_log_index > last {
                return Ok(AppendResponse {
                    status: Status::Ok,
                    term: self.ctx.term,
                    succeeded: false,
                    log_index: last,
                });
            }
            if let Some(term) = self.ctx.log.term(req.prev_log_index)? {
                // A zero prev term means the leader compacted that entry
                // away; compaction never touches uncommitted entries, so the
                // prefix is known to match and the check is skipped.
                if req.prev_log_term != 0 && term != req.prev_log_term {
                    return Ok(AppendResponse {
                        status: Status::Ok,
                        term: self.ctx.term,
                        succeeded: false,
                        log_index: req.prev_log_index - 1,
                    });
                }
            }
            // A missing entry below our last index is a compaction hole;
            // only committed entries are cleaned, so the prefix matches.
        }

        for entry in &req.entries {
            if entry.index <= self.ctx.log.last_index() {
                match self.ctx.log.get(entry.index)? {
                    Some(existing) if existing.term != entry.term => {
                        // Conflicting uncommitted suffix: drop it and take
                        // the leader's entry.
                        self.ctx.log.truncate(entry.index - 1)?;
                        self.ctx.log.append_replica(entry)?;
                    }
                    _ => {}
                }
            } else {
                self.ctx.log.append_replica(entry)?;
            }
        }

        let commit = req.commit_index.min(self.ctx.log.last_index());
        if commit > self.ctx.commit_index {
            self.ctx.commit_index = commit;
            self.ctx.log.commit(commit);
            self.apply_committed()?;
        }
        self.ctx.global_index = req.global_index;

        // Confirm exactly the range this request proved matched; a stale
        // longer log must not inflate the leader's match index.
        let matched = req
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(req.prev_log_index);
        Ok(AppendResponse {
            status: Status::Ok,
            term: self.ctx.term,
            succeeded: true,
            log_index: matched,
        })
    }

    // ------------------------------------------------------------------
    // Votes and polls
    // ------------------------------------------------------------------

    fn handle_vote(&mut self, req: VoteRequest) -> Result<VoteResponse> {
        if req.term > self.ctx.term {
            self.ctx.set_term(req.term);
            if matches!(self.role, Role::Candidate(_) | Role::Leader(_)) {
                self.become_follower();
            }
        }

        let voted = if req.term < self.ctx.term {
            debug!(candidate = req.candidate, "vote rejected: stale term");
            false
        } else if matches!(self.role, Role::Passive) {
            false
        } else if !self.ctx.cluster.is_active(req.candidate) {
            debug!(candidate = req.candidate, "vote rejected: unknown candidate");
            false
        } else if self.ctx.last_voted_for == 0 || self.ctx.last_voted_for == req.candidate {
            if self.ctx.log_up_to_date(req.last_log_index, req.last_log_term) {
                self.ctx.last_voted_for = req.candidate;
                if matches!(self.role, Role::Follower(_)) {
                    self.reset_election_timer();
                }
                true
            } else {
                debug!(candidate = req.candidate, "vote rejected: log behind");
                false
            }
        } else {
            debug!(
                candidate = req.candidate,
                voted_for = self.ctx.last_voted_for,
                "vote rejected: already voted"
            );
            false
        };

        Ok(VoteResponse {
            status: Status::Ok,
            term: self.ctx.term,
            voted,
        })
    }

    fn handle_poll(&mut self, req: PollRequest) -> Result<PollResponse> {
        if req.term > self.ctx.term {
            self.ctx.set_term(req.term);
            if matches!(self.role, Role::Candidate(_) | Role::Leader(_)) {
                self.become_follower();
            }
        }

        let accepted = if req.term < self.ctx.term {
            false
        } else if matches!(self.role, Role::Passive | Role::Leader(_)) {
            false
        } else {
            self.ctx.log_up_to_date(req.last_log_index, req.last_log_term)
        };

        Ok(PollResponse {
            status: Status::Ok,
            term: self.ctx.term,
            accepted,
        })
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    fn handle_command(
        &mut self,
        req: CommandRequest,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        if !matches!(self.role, Role::Leader(_)) {
            self.forward_or_reject(Request::Command(req), reply);
            return Ok(());
        }

        let entry = self.ctx.log.create(
            self.ctx.term,
            Payload::Command {
                session: req.session,
                request: req.request,
                response: req.response,
                timestamp: now_ms(),
                command: req.command,
            },
        );
        self.leader_append(entry, OpKind::Command, reply)
    }

    fn handle_register(
        &mut self,
        req: RegisterRequest,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        if !matches!(self.role, Role::Leader(_)) {
            self.forward_or_reject(Request::Register(req), reply);
            return Ok(());
        }

        let entry = self.ctx.log.create(
            self.ctx.term,
            Payload::Register {
                member: req.member,
                timestamp: now_ms(),
            },
        );
        self.leader_append(entry, OpKind::Register, reply)
    }

    fn handle_keep_alive(
        &mut self,
        req: KeepAliveRequest,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        if !matches!(self.role, Role::Leader(_)) {
            self.forward_or_reject(Request::KeepAlive(req), reply);
            return Ok(());
        }

        let entry = self.ctx.log.create(
            self.ctx.term,
            Payload::KeepAlive {
                session: req.session,
                timestamp: now_ms(),
            },
        );
        self.leader_append(entry, OpKind::KeepAlive, reply)
    }

    fn handle_configure(
        &mut self,
        req: ConfigureRequest,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        let Role::Leader(state) = &mut self.role else {
            self.forward_or_reject(Request::Configure(req), reply);
            return Ok(());
        };

        // Only one configuration change may be uncommitted at a time.
        if state.configuring.is_some() {
            let _ = reply.send(op_error_response(OpKind::Configure, RaftError::InternalError));
            return Ok(());
        }

        let member_id = req.member.id();
        let already_done = match req.change {
            MembershipChange::Join => self.ctx.cluster.contains(member_id),
            MembershipChange::Leave => !self.ctx.cluster.contains(member_id),
            MembershipChange::Promote => self.ctx.cluster.is_active(member_id),
            MembershipChange::Demote => self.ctx.cluster.is_passive(member_id),
        };
        if already_done {
            let _ = reply.send(Response::Configure(ConfigureResponse {
                status: Status::Ok,
                error: None,
                term: self.ctx.term,
                leader: Some(self.local.clone()),
            }));
            return Ok(());
        }

        let payload = match req.change {
            MembershipChange::Join => Payload::Join { member: req.member },
            MembershipChange::Leave => Payload::Leave { member: req.member },
            MembershipChange::Promote => Payload::Promote { member: req.member },
            MembershipChange::Demote => Payload::Demote { member: req.member },
        };
        let entry = self.ctx.log.create(self.ctx.term, payload);
        // Set before appending: in a single-member cluster the entry
        // commits and applies inside leader_append, which clears the flag.
        if let Role::Leader(state) = &mut self.role {
            state.configuring = Some(entry.index);
        }
        self.leader_append(entry, OpKind::Configure, reply)
    }

    /// Append an entry, register the client reply for its commitment, and
    /// kick replication.
    fn leader_append(
        &mut self,
        entry: Entry,
        kind: OpKind,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        let index = self.ctx.log.append(&entry)?;
        debug!(index, ?kind, "appended entry");
        if let Role::Leader(state) = &mut self.role {
            state.pending.insert(index, PendingOp { kind, reply });
        }
        self.replicate()?;
        self.leader_recompute_commit()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn handle_query(&mut self, req: QueryRequest, reply: oneshot::Sender<Response>) -> Result<()> {
        match &self.role {
            Role::Leader(state) => match req.consistency {
                Consistency::Serializable => {
                    let response = self.answer_query(&req);
                    let _ = reply.send(Response::Query(response));
                }
                Consistency::LinearizableLease => {
                    let now = now_ms();
                    let lease = state
                        .replicator
                        .quorum_commit_time(&self.ctx.cluster, now);
                    if now.saturating_sub(lease)
                        < self.config.election_timeout.as_millis() as u64
                    {
                        let response = self.answer_query(&req);
                        let _ = reply.send(Response::Query(response));
                    } else {
                        self.leader_strict_query(req, reply)?;
                    }
                }
                Consistency::LinearizableStrict => self.leader_strict_query(req, reply)?,
            },
            _ => {
                // A server that has seen the client's version can serve
                // serializable reads locally; everything else goes to the
                // leader.
                if req.consistency == Consistency::Serializable
                    && req.version <= self.ctx.last_applied
                {
                    let response = self.answer_query(&req);
                    let _ = reply.send(Response::Query(response));
                } else {
                    self.forward_or_reject(Request::Query(req), reply);
                }
            }
        }
        Ok(())
    }

    /// Strict linearizable read: confirm leadership with a quorum round
    /// before answering.
    fn leader_strict_query(
        &mut self,
        req: QueryRequest,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        let alone = match &self.role {
            Role::Leader(state) => state.replicator.is_empty(),
            _ => {
                self.forward_or_reject(Request::Query(req), reply);
                return Ok(());
            }
        };
        if alone {
            let response = self.answer_query(&req);
            let _ = reply.send(Response::Query(response));
            return Ok(());
        }
        if let Role::Leader(state) = &mut self.role {
            state.query_waiters.push(QueryWaiter {
                started: now_ms(),
                request: req,
                reply,
            });
        }
        self.replicate()
    }

    fn answer_query(&self, req: &QueryRequest) -> QueryResponse {
        let version = self.ctx.last_applied;
        match self.executor.query(version, &req.query) {
            Ok(result) => QueryResponse {
                status: Status::Ok,
                error: None,
                version,
                result,
            },
            Err(err) => QueryResponse {
                status: Status::Error,
                error: Some(err),
                version,
                result: Bytes::new(),
            },
        }
    }

    /// Answer strict queries whose quorum round has completed.
    fn leader_check_query_waiters(&mut self) {
        let ready: Vec<QueryWaiter> = {
            let Role::Leader(state) = &mut self.role else {
                return;
            };
            let lease = state
                .replicator
                .quorum_commit_time(&self.ctx.cluster, now_ms());
            let (ready, rest) = state
                .query_waiters
                .drain(..)
                .partition(|w| w.started <= lease);
            state.query_waiters = rest;
            ready
        };
        for waiter in ready {
            let response = self.answer_query(&waiter.request);
            let _ = waiter.reply.send(Response::Query(response));
        }
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Send an append to every idle peer: a batch if entries are pending,
    /// a bare heartbeat otherwise.
    fn replicate(&mut self) -> Result<()> {
        let (epoch, targets) = {
            let Role::Leader(state) = &mut self.role else {
                return Ok(());
            };
            let epoch = state.epoch;
            let mut targets = Vec::new();
            for peer in state.replicator.peers_mut() {
                if peer.committing {
                    continue;
                }
                peer.committing = true;
                targets.push((peer.id, peer.address.clone(), peer.next_index));
            }
            (epoch, targets)
        };

        for (peer_id, address, next_index) in targets {
            let request = self.build_append_request(next_index)?;
            self.send_append(epoch, peer_id, address, request);
        }
        Ok(())
    }

    fn build_append_request(&mut self, next_index: u64) -> Result<AppendRequest> {
        let last = self.ctx.log.last_index();
        let prev_log_index = next_index.saturating_sub(1);
        let prev_log_term = if prev_log_index > 0 {
            self.ctx.log.term(prev_log_index)?.unwrap_or(0)
        } else {
            0
        };

        let mut entries = Vec::new();
        if !self.ctx.log.is_empty() && next_index <= last {
            let mut size = 0usize;
            let mut index = next_index;
            while index <= last && size < MAX_BATCH_SIZE {
                // Compaction holes are skipped; the retained entries are
                // sufficient to rebuild state.
                if let Some(entry) = self.ctx.log.get(index)? {
                    size += entry.size();
                    entries.push(entry);
                }
                index += 1;
            }
        }

        Ok(AppendRequest {
            term: self.ctx.term,
            leader: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.ctx.commit_index,
            global_index: self.ctx.global_index,
        })
    }

    fn send_append(&self, epoch: u64, peer: u64, address: Address, request: AppendRequest) {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let response = match transport.connect(&address).await {
                Ok(connection) => match connection.send(Request::Append(request)).await {
                    Ok(Response::Append(response)) => Some(response),
                    Ok(_) | Err(_) => None,
                },
                Err(_) => None,
            };
            let _ = tx.send(Event::AppendReply {
                epoch,
                peer,
                response,
            });
        });
    }

    fn handle_append_reply(
        &mut self,
        epoch: u64,
        peer: u64,
        response: Option<AppendResponse>,
    ) -> Result<()> {
        let now = now_ms();
        let last_index = self.ctx.log.last_index();
        let first_index = self.ctx.log.first_index().max(1);
        let current_term = self.ctx.term;

        let (higher_term, more) = {
            let Role::Leader(state) = &mut self.role else {
                return Ok(());
            };
            if epoch != state.epoch {
                return Ok(());
            }
            let Some(peer_state) = state.replicator.peer_mut(peer) else {
                return Ok(());
            };
            peer_state.committing = false;
            let Some(response) = response else {
                // Transport failure; the next heartbeat retries.
                return Ok(());
            };
            peer_state.commit_time = now;

            if response.term > current_term {
                (Some(response.term), false)
            } else {
                if response.succeeded {
                    peer_state.match_index = peer_state.match_index.max(response.log_index);
                    peer_state.next_index =
                        peer_state.next_index.max(peer_state.match_index + 1);
                } else {
                    // Walk back toward the follower's log.
                    peer_state.match_index = peer_state.match_index.max(response.log_index);
                    peer_state.next_index = if peer_state.match_index > 0 {
                        peer_state.match_index + 1
                    } else {
                        first_index
                    };
                }
                (None, peer_state.next_index <= last_index)
            }
        };

        if let Some(term) = higher_term {
            debug!(peer, term, "peer reported a higher term; stepping down");
            self.ctx.set_term(term);
            self.become_follower();
            return Ok(());
        }

        self.leader_recompute_commit()?;
        self.leader_check_query_waiters();
        if more {
            self.replicate()?;
        }
        Ok(())
    }

    /// Advance the commit index to the quorum-replicated boundary. Entries
    /// only commit through an entry of the current term (§5.4.2 of the Raft
    /// paper); earlier-term entries commit indirectly.
    fn leader_recompute_commit(&mut self) -> Result<()> {
        let (candidate, global) = match &self.role {
            Role::Leader(state) => (
                state
                    .replicator
                    .quorum_match(&self.ctx.cluster, self.ctx.log.last_index()),
                state.replicator.global_index(self.ctx.log.last_index()),
            ),
            _ => return Ok(()),
        };

        self.ctx.global_index = global;
        if candidate > self.ctx.commit_index
            && self.ctx.log.term(candidate)? == Some(self.ctx.term)
        {
            self.ctx.commit_index = candidate;
            self.ctx.log.commit(candidate);
            self.apply_committed()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Applying committed entries
    // ------------------------------------------------------------------

    fn apply_committed(&mut self) -> Result<()> {
        let mut outcomes: Vec<(u64, ApplyOutcome)> = Vec::new();
        let mut config_changed = false;
        while self.ctx.last_applied < self.ctx.commit_index {
            let index = self.ctx.last_applied + 1;
            if let Some(entry) = self.ctx.log.get(index)? {
                let outcome =
                    self.executor
                        .apply(&entry, &mut self.ctx.sessions, &mut self.ctx.cluster);
                config_changed |= matches!(outcome, ApplyOutcome::Configuration);
                outcomes.push((index, outcome));
            }
            self.ctx.last_applied = index;
        }

        if config_changed {
            self.on_configuration_applied();
        }
        self.complete_pending(outcomes);
        Ok(())
    }

    /// React to an applied configuration change: refresh the replicator,
    /// clear the in-flight configuration flag, and change roles if the local
    /// server's voting status changed.
    fn on_configuration_applied(&mut self) {
        let is_active = self.ctx.cluster.is_local_active();
        let config_index = self.ctx.cluster.config_index();

        if let Role::Leader(state) = &mut self.role {
            state
                .replicator
                .update(&self.ctx.cluster, self.ctx.log.last_index(), now_ms());
            if state.configuring.is_some_and(|index| config_index >= index) {
                state.configuring = None;
            }
        }

        match (&self.role, is_active) {
            (Role::Passive, true) => {
                info!(address = %self.local, "promoted to voting member");
                self.become_follower();
            }
            (Role::Follower(_) | Role::Candidate(_) | Role::Leader(_), false) => {
                info!(address = %self.local, "no longer a voting member");
                self.become_passive();
            }
            _ => {}
        }
    }

    fn complete_pending(&mut self, outcomes: Vec<(u64, ApplyOutcome)>) {
        let completed: Vec<(PendingOp, ApplyOutcome)> = {
            let Role::Leader(state) = &mut self.role else {
                return;
            };
            outcomes
                .into_iter()
                .filter_map(|(index, outcome)| {
                    state.pending.remove(&index).map(|op| (op, outcome))
                })
                .collect()
        };

        for (op, outcome) in completed {
            let response = self.build_op_response(op.kind, outcome);
            let _ = op.reply.send(response);
        }
    }

    fn build_op_response(&self, kind: OpKind, outcome: ApplyOutcome) -> Response {
        match (kind, outcome) {
            (OpKind::Command, ApplyOutcome::Command(Ok(result))) => {
                Response::Command(CommandResponse {
                    status: Status::Ok,
                    error: None,
                    result,
                })
            }
            (OpKind::Command, ApplyOutcome::Command(Err(err))) => {
                op_error_response(OpKind::Command, err)
            }
            (OpKind::Register, ApplyOutcome::SessionRegistered(session)) => {
                Response::Register(RegisterResponse {
                    status: Status::Ok,
                    error: None,
                    session,
                    term: self.ctx.term,
                    leader: Some(self.local.clone()),
                    members: self.ctx.cluster.active_members().to_vec(),
                })
            }
            (OpKind::KeepAlive, ApplyOutcome::KeepAlive(Ok(()))) => {
                Response::KeepAlive(KeepAliveResponse {
                    status: Status::Ok,
                    error: None,
                    term: self.ctx.term,
                    leader: Some(self.local.clone()),
                    members: self.ctx.cluster.active_members().to_vec(),
                })
            }
            (OpKind::KeepAlive, ApplyOutcome::KeepAlive(Err(err))) => {
                op_error_response(OpKind::KeepAlive, err)
            }
            (OpKind::Configure, ApplyOutcome::Configuration) => {
                Response::Configure(ConfigureResponse {
                    status: Status::Ok,
                    error: None,
                    term: self.ctx.term,
                    leader: Some(self.local.clone()),
                })
            }
            (kind, outcome) => {
                warn!(?kind, ?outcome, "unexpected apply outcome for pending op");
                op_error_response(kind, RaftError::InternalError)
            }
        }
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn handle_election_timeout(&mut self, seq: u64) -> Result<()> {
        if seq != self.timer_seq {
            return Ok(()); // superseded timer
        }
        match &self.role {
            Role::Follower(_) => self.start_poll(),
            Role::Candidate(_) => {
                debug!(address = %self.local, term = self.ctx.term, "election timed out");
                self.become_candidate()
            }
            Role::Leader(_) | Role::Passive => Ok(()),
        }
    }

    /// Pre-vote: probe the cluster before disturbing the term. Only a
    /// quorum-accepted poll proceeds to a real election.
    fn start_poll(&mut self) -> Result<()> {
        let peers = self.ctx.cluster.active_peers();
        if peers.is_empty() {
            return self.become_candidate();
        }

        info!(address = %self.local, term = self.ctx.term, "election timeout; polling");
        let quorum = self.ctx.cluster.quorum();
        let voters = self.ctx.cluster.active_members().len();
        if let Role::Follower(state) = &mut self.role {
            state.polling = Some(VoteCount::with_self(quorum, voters));
        }

        let request = PollRequest {
            term: self.ctx.term,
            candidate: self.id,
            last_log_index: self.ctx.log.last_index(),
            last_log_term: self.ctx.log.last_term()?,
        };
        let epoch = self.role_epoch;
        for address in peers {
            let transport = Arc::clone(&self.transport);
            let tx = self.tx.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let response = match transport.connect(&address).await {
                    Ok(connection) => match connection.send(Request::Poll(request)).await {
                        Ok(Response::Poll(response)) => Some(response),
                        Ok(_) | Err(_) => None,
                    },
                    Err(_) => None,
                };
                let _ = tx.send(Event::PollReply { epoch, response });
            });
        }

        // Retry the poll if it stalls.
        self.reset_election_timer();
        Ok(())
    }

    fn handle_poll_reply(&mut self, epoch: u64, response: Option<PollResponse>) -> Result<()> {
        if epoch != self.role_epoch {
            return Ok(());
        }
        let current_term = self.ctx.term;
        let mut higher_term = None;
        let decision = {
            let Role::Follower(state) = &mut self.role else {
                return Ok(());
            };
            let Some(votes) = state.polling.as_mut() else {
                return Ok(());
            };
            match response {
                Some(response) if response.term > current_term => {
                    higher_term = Some(response.term);
                    Some(false)
                }
                Some(response) if response.accepted => votes.succeed(),
                Some(_) | None => votes.fail(),
            }
        };

        if let Some(term) = higher_term {
            self.ctx.set_term(term);
            if let Role::Follower(state) = &mut self.role {
                state.polling = None;
            }
            return Ok(());
        }

        match decision {
            Some(true) => {
                if let Role::Follower(state) = &mut self.role {
                    state.polling = None;
                }
                self.become_candidate()
            }
            Some(false) => {
                debug!(address = %self.local, "poll rejected; staying follower");
                if let Role::Follower(state) = &mut self.role {
                    state.polling = None;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn become_candidate(&mut self) -> Result<()> {
        self.cancel_role();
        self.role_epoch += 1;
        self.ctx.set_term(self.ctx.term + 1);
        self.ctx.last_voted_for = self.id;
        self.ctx.leader = None;

        let peers = self.ctx.cluster.active_peers();
        info!(address = %self.local, term = self.ctx.term, "starting election");
        if peers.is_empty() {
            // Single-member cluster: elected unopposed.
            return self.become_leader();
        }

        let quorum = self.ctx.cluster.quorum();
        let voters = self.ctx.cluster.active_members().len();
        self.role = Role::Candidate(CandidateState {
            epoch: self.role_epoch,
            votes: VoteCount::with_self(quorum, voters),
        });

        let request = VoteRequest {
            term: self.ctx.term,
            candidate: self.id,
            last_log_index: self.ctx.log.last_index(),
            last_log_term: self.ctx.log.last_term()?,
        };
        let epoch = self.role_epoch;
        for address in peers {
            let transport = Arc::clone(&self.transport);
            let tx = self.tx.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let response = match transport.connect(&address).await {
                    Ok(connection) => match connection.send(Request::Vote(request)).await {
                        Ok(Response::Vote(response)) => Some(response),
                        Ok(_) | Err(_) => None,
                    },
                    Err(_) => None,
                };
                let _ = tx.send(Event::VoteReply { epoch, response });
            });
        }

        self.reset_election_timer();
        Ok(())
    }

    fn handle_vote_reply(&mut self, epoch: u64, response: Option<VoteResponse>) -> Result<()> {
        let current_term = self.ctx.term;
        // Err carries a higher term observed from the responder.
        let decision: std::result::Result<Option<bool>, u64> = {
            let Role::Candidate(state) = &mut self.role else {
                return Ok(());
            };
            if epoch != state.epoch {
                return Ok(());
            }
            match response {
                Some(response) if response.term > current_term => Err(response.term),
                Some(response) if response.voted && response.term == current_term => {
                    Ok(state.votes.succeed())
                }
                Some(_) | None => Ok(state.votes.fail()),
            }
        };

        match decision {
            Err(term) => {
                self.ctx.set_term(term);
                self.become_follower();
                Ok(())
            }
            Ok(Some(true)) => self.become_leader(),
            Ok(Some(false)) => {
                debug!(address = %self.local, term = current_term, "election lost");
                self.become_follower();
                Ok(())
            }
            Ok(None) => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    /// Tear down the outgoing role: outstanding client futures get errors,
    /// and bumping the epoch turns every in-flight completion into a no-op.
    fn cancel_role(&mut self) {
        if let Role::Leader(state) = &mut self.role {
            let pending = std::mem::take(&mut state.pending);
            let waiters = std::mem::take(&mut state.query_waiters);
            for (_, op) in pending {
                let _ = op.reply.send(op_error_response(op.kind, RaftError::NoLeader));
            }
            for waiter in waiters {
                let _ = waiter
                    .reply
                    .send(op_error_response(OpKind::Command, RaftError::NoLeader));
            }
        }
    }

    fn become_follower(&mut self) {
        self.cancel_role();
        self.role_epoch += 1;
        info!(address = %self.local, term = self.ctx.term, "transitioning to follower");
        self.role = Role::Follower(FollowerState { polling: None });
        self.reset_election_timer();
    }

    fn become_passive(&mut self) {
        self.cancel_role();
        self.role_epoch += 1;
        self.timer_seq += 1; // retire any running election timer
        info!(address = %self.local, term = self.ctx.term, "transitioning to passive");
        self.role = Role::Passive;
    }

    fn become_leader(&mut self) -> Result<()> {
        self.cancel_role();
        self.role_epoch += 1;
        self.timer_seq += 1; // leaders run no election timer
        info!(address = %self.local, term = self.ctx.term, "transitioning to leader");

        self.ctx.leader = Some(self.id);
        let replicator = Replicator::new(&self.ctx.cluster, self.ctx.log.last_index(), now_ms());
        let heartbeat = self.spawn_heartbeat(self.role_epoch);
        self.role = Role::Leader(LeaderState {
            epoch: self.role_epoch,
            replicator,
            pending: BTreeMap::new(),
            query_waiters: Vec::new(),
            configuring: None,
            _heartbeat: heartbeat,
        });

        // Commit a no-op to pull any earlier-term entries over the line.
        let noop = self.ctx.log.create(self.ctx.term, Payload::NoOp);
        self.ctx.log.append(&noop)?;

        // First leadership of a bootstrapped multi-member cluster: commit
        // the configured view so late joiners learn it from the log.
        if self.ctx.cluster.config_index() == 0
            && self.ctx.cluster.active_members().len() + self.ctx.cluster.passive_members().len()
                > 1
        {
            let configuration = self.ctx.log.create(
                self.ctx.term,
                Payload::Configuration {
                    active: self.ctx.cluster.active_members().to_vec(),
                    passive: self.ctx.cluster.passive_members().to_vec(),
                },
            );
            self.ctx.log.append(&configuration)?;
        }

        self.replicate()?;
        self.leader_recompute_commit()
    }

    // ------------------------------------------------------------------
    // Timers and background work
    // ------------------------------------------------------------------

    fn reset_election_timer(&mut self) {
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let base = self.config.election_timeout;
        let jitter = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
        let delay = base + Duration::from_millis(jitter);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::ElectionTimeout { seq });
        });
    }

    fn spawn_heartbeat(&self, epoch: u64) -> oneshot::Sender<()> {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let tx = self.tx.clone();
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => {
                        if tx.send(Event::HeartbeatTick { epoch }).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        cancel_tx
    }

    fn handle_heartbeat_tick(&mut self, epoch: u64) -> Result<()> {
        let current = matches!(&self.role, Role::Leader(state) if state.epoch == epoch);
        if current {
            self.replicate()
        } else {
            Ok(())
        }
    }

    fn handle_compact(&mut self) -> Result<()> {
        if self.ctx.log.sealed_segments().is_empty() {
            return Ok(());
        }
        let last_applied = self.ctx.last_applied;
        let global_index = self.ctx.global_index;
        let config_index = self.ctx.cluster.config_index();

        let ServerContext { log, sessions, .. } = &mut self.ctx;
        let sessions = &*sessions;
        let executor = &self.executor;
        let cleanable = move |entry: &Entry| -> bool {
            if entry.index > last_applied {
                return false;
            }
            match &entry.payload {
                Payload::NoOp | Payload::Query { .. } | Payload::KeepAlive { .. } => true,
                Payload::Register { .. } => !sessions.contains(entry.index),
                Payload::Command { command, .. } => {
                    !executor.retain_command(entry.index, command)
                }
                Payload::Configuration { .. }
                | Payload::Join { .. }
                | Payload::Leave { .. }
                | Payload::Promote { .. }
                | Payload::Demote { .. } => entry.index < config_index,
            }
        };

        self.compactor.minor(log, &cleanable)?;
        self.compactor.major(log, global_index, &cleanable)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forwarding and joining
    // ------------------------------------------------------------------

    /// Forward a client request to the known leader, or reject it.
    fn forward_or_reject(&mut self, request: Request, reply: oneshot::Sender<Response>) {
        let leader_address = self
            .ctx
            .leader
            .filter(|&id| id != self.id)
            .and_then(|id| self.ctx.cluster.address_of(id).cloned());

        let Some(address) = leader_address else {
            let _ = reply.send(no_leader_response(&request));
            return;
        };

        debug!(leader = %address, "forwarding request to leader");
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let fallback = no_leader_response(&request);
            let response = match transport.connect(&address).await {
                Ok(connection) => connection.send(request).await.unwrap_or(fallback),
                Err(_) => fallback,
            };
            let _ = reply.send(response);
        });
    }

    /// A server outside the voting set announces itself to the cluster and
    /// keeps trying until a leader admits it.
    fn spawn_join_request(&self) {
        let transport = Arc::clone(&self.transport);
        let members = self.config.members.clone();
        let local = self.local.clone();
        let retry = self.config.election_timeout;
        tokio::spawn(async move {
            loop {
                for address in &members {
                    let request = Request::Configure(ConfigureRequest {
                        change: MembershipChange::Join,
                        member: local.clone(),
                    });
                    if let Ok(connection) = transport.connect(address).await {
                        if let Ok(Response::Configure(response)) = connection.send(request).await {
                            if response.status == Status::Ok {
                                info!(address = %local, "join accepted");
                                return;
                            }
                        }
                    }
                }
                tokio::time::sleep(retry).await;
            }
        });
    }
}

/// Build the NO_LEADER rejection matching a request's expected response.
fn no_leader_response(request: &Request) -> Response {
    let kind = match request {
        Request::Command(_) => OpKind::Command,
        Request::Register(_) => OpKind::Register,
        Request::KeepAlive(_) => OpKind::KeepAlive,
        Request::Configure(_) => OpKind::Configure,
        Request::Query(_) => {
            return Response::Query(QueryResponse {
                status: Status::Error,
                error: Some(RaftError::NoLeader),
                version: 0,
                result: Bytes::new(),
            })
        }
        // Protocol-internal requests are never forwarded.
        Request::Append(_) | Request::Vote(_) | Request::Poll(_) => {
            return Response::Query(QueryResponse {
                status: Status::Error,
                error: Some(RaftError::IllegalMemberState),
                version: 0,
                result: Bytes::new(),
            })
        }
    };
    op_error_response(kind, RaftError::NoLeader)
}

fn op_error_response(kind: OpKind, error: RaftError) -> Response {
    match kind {
        OpKind::Command => Response::Command(CommandResponse {
            status: Status::Error,
            error: Some(error),
            result: Bytes::new(),
        }),
        OpKind::Register => Response::Register(RegisterResponse {
            status: Status::Error,
            error: Some(error),
            session: 0,
            term: 0,
            leader: None,
            members: vec![],
        }),
        OpKind::KeepAlive => Response::KeepAlive(KeepAliveResponse {
            status: Status::Error,
            error: Some(error),
            term: 0,
            leader: None,
            members: vec![],
        }),
        OpKind::Configure => Response::Configure(ConfigureResponse {
            status: Status::Error,
            error: Some(error),
            term: 0,
            leader: None,
        }),
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_count_majority_of_three() {
        // Quorum 2 of 3 voters; self already counted.
        let mut votes = VoteCount::with_self(2, 3);
        assert!(!votes.decided);
        assert_eq!(votes.succeed(), Some(true));
        assert_eq!(votes.succeed(), None, "already decided");
    }

    #[test]
    fn test_vote_count_failure_of_three() {
        let mut votes = VoteCount::with_self(2, 3);
        assert_eq!(votes.fail(), None, "one rejection is survivable");
        assert_eq!(votes.fail(), Some(false), "two rejections end it");
    }

    #[test]
    fn test_vote_count_single_member_decides_immediately() {
        let votes = VoteCount::with_self(1, 1);
        assert!(votes.decided);
    }

    #[test]
    fn test_vote_count_five_member_split() {
        let mut votes = VoteCount::with_self(3, 5);
        assert_eq!(votes.succeed(), None);
        assert_eq!(votes.fail(), None);
        assert_eq!(votes.fail(), None);
        // 1 self + 1 yes, 2 no, 1 outstanding: the last vote decides.
        assert_eq!(votes.succeed(), Some(true));
    }

    #[test]
    fn test_no_leader_response_shapes() {
        let response = no_leader_response(&Request::Command(CommandRequest {
            session: 1,
            request: 1,
            response: 0,
            command: Bytes::new(),
        }));
        match response {
            Response::Command(resp) => {
                assert_eq!(resp.status, Status::Error);
                assert_eq!(resp.error, Some(RaftError::NoLeader));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
