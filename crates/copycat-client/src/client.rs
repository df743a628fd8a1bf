//! The Session Client
//!
//! [`RaftClient`] is the "remote" member state: it holds no log and no vote,
//! only a registered session against the cluster. All requests go to the
//! current leader; followers forward on the client's behalf, and every
//! session response carries the leader and member list so the client
//! retargets without a separate discovery round.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use copycat_core::{
    Address, CommandRequest, ConfigureRequest, Consistency, KeepAliveRequest, MembershipChange,
    QueryRequest, RaftError, RegisterRequest, Request, Response, Status,
};
use copycat_raft::{Connection as _, Transport};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Session keep-alive period. Should be well inside the cluster's
    /// session timeout.
    pub keep_alive_interval: Duration,

    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

/// Where requests are aimed: the known leader first, then the member list.
struct Targets {
    members: Vec<Address>,
    leader: Option<Address>,
}

/// The client's session state. `id == 0` means unregistered.
struct SessionState {
    id: u64,
    /// Last issued request sequence number.
    request: u64,
    /// Highest request number whose response the client has received.
    acknowledged: u64,
    /// Highest state version observed in query responses.
    version: u64,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    /// The client's own identity, recorded in its RegisterEntry.
    address: Address,
    targets: Mutex<Targets>,
    session: Mutex<SessionState>,
}

/// A session-holding client of a Copycat cluster.
pub struct RaftClient {
    inner: Arc<ClientInner>,
    keep_alive: JoinHandle<()>,
}

static CLIENT_SEQ: AtomicU16 = AtomicU16::new(1);

impl RaftClient {
    /// Register a session with the cluster and start the keep-alive task.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        members: Vec<Address>,
        config: ClientConfig,
    ) -> Result<RaftClient> {
        let address = Address::new("client", CLIENT_SEQ.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new(ClientInner {
            transport,
            config,
            address,
            targets: Mutex::new(Targets {
                members,
                leader: None,
            }),
            session: Mutex::new(SessionState {
                id: 0,
                request: 0,
                acknowledged: 0,
                version: 0,
            }),
        });

        inner.register().await?;
        let keep_alive = spawn_keep_alive(Arc::downgrade(&inner));
        Ok(RaftClient { inner, keep_alive })
    }

    /// The session id, once registered.
    pub async fn session_id(&self) -> u64 {
        self.inner.session.lock().await.id
    }

    /// Submit a command for linearizable application to the state machine.
    /// Retries reuse the same request number, so a command is applied at
    /// most once even when responses are lost.
    pub async fn submit(&self, command: Bytes) -> Result<Bytes> {
        let mut request_id = self.inner.next_request().await;
        let mut attempt = 0;

        loop {
            let (session_id, acknowledged) = {
                let session = self.inner.session.lock().await;
                (session.id, session.acknowledged)
            };
            let request = Request::Command(CommandRequest {
                session: session_id,
                request: request_id,
                response: acknowledged,
                command: command.clone(),
            });

            match self.inner.send_round(request).await {
                Some(Response::Command(response)) => {
                    if response.status == Status::Ok {
                        let mut session = self.inner.session.lock().await;
                        session.acknowledged = session.acknowledged.max(request_id);
                        return Ok(response.result);
                    }
                    match response.error {
                        Some(RaftError::UnknownSession) => {
                            debug!("session expired; re-registering");
                            self.inner.register().await?;
                            request_id = self.inner.next_request().await;
                        }
                        Some(error) if error.is_retryable() => {
                            self.inner.clear_leader().await;
                        }
                        Some(error) => return Err(ClientError::Raft(error)),
                        None => {}
                    }
                }
                Some(_) | None => {
                    self.inner.clear_leader().await;
                }
            }

            attempt += 1;
            if !self.inner.config.retry.allows(attempt) {
                return Err(ClientError::Unavailable(
                    "command did not complete within the retry budget".into(),
                ));
            }
            tokio::time::sleep(self.inner.config.retry.backoff(attempt - 1)).await;
        }
    }

    /// Submit a read-only query at the requested consistency level.
    pub async fn query(&self, query: Bytes, consistency: Consistency) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            let (session_id, version) = {
                let session = self.inner.session.lock().await;
                (session.id, session.version)
            };
            let request = Request::Query(QueryRequest {
                session: session_id,
                version,
                consistency,
                query: query.clone(),
            });

            match self.inner.send_round(request).await {
                Some(Response::Query(response)) => {
                    if response.status == Status::Ok {
                        let mut session = self.inner.session.lock().await;
                        session.version = session.version.max(response.version);
                        return Ok(response.result);
                    }
                    match response.error {
                        Some(error) if error.is_retryable() => {
                            self.inner.clear_leader().await;
                        }
                        Some(error) => return Err(ClientError::Raft(error)),
                        None => {}
                    }
                }
                Some(_) | None => {
                    self.inner.clear_leader().await;
                }
            }

            attempt += 1;
            if !self.inner.config.retry.allows(attempt) {
                return Err(ClientError::Unavailable(
                    "query did not complete within the retry budget".into(),
                ));
            }
            tokio::time::sleep(self.inner.config.retry.backoff(attempt - 1)).await;
        }
    }

    /// Request a membership change (admin operation).
    pub async fn configure(&self, change: MembershipChange, member: Address) -> Result<()> {
        let mut attempt = 0;
        loop {
            let request = Request::Configure(ConfigureRequest {
                change,
                member: member.clone(),
            });
            match self.inner.send_round(request).await {
                Some(Response::Configure(response)) if response.status == Status::Ok => {
                    return Ok(());
                }
                Some(Response::Configure(response)) => match response.error {
                    Some(error) if !error.is_retryable() && error != RaftError::InternalError => {
                        return Err(ClientError::Raft(error));
                    }
                    _ => self.inner.clear_leader().await,
                },
                Some(_) | None => self.inner.clear_leader().await,
            }

            attempt += 1;
            if !self.inner.config.retry.allows(attempt) {
                return Err(ClientError::Unavailable(
                    "membership change did not complete within the retry budget".into(),
                ));
            }
            tokio::time::sleep(self.inner.config.retry.backoff(attempt - 1)).await;
        }
    }

    /// Stop the keep-alive task and drop the session. The cluster expires
    /// the session once keep-alives stop arriving.
    pub async fn close(self) {
        self.keep_alive.abort();
    }
}

impl ClientInner {
    /// Take the next request sequence number, registering first if needed.
    async fn next_request(&self) -> u64 {
        let mut session = self.session.lock().await;
        session.request += 1;
        session.request
    }

    async fn clear_leader(&self) {
        self.targets.lock().await.leader = None;
    }

    /// Try the known leader, then every member, returning the first
    /// response. Session responses teach us the current leader and members.
    async fn send_round(&self, request: Request) -> Option<Response> {
        let candidates: Vec<Address> = {
            let targets = self.targets.lock().await;
            targets
                .leader
                .iter()
                .chain(
                    targets
                        .members
                        .iter()
                        .filter(|m| targets.leader.as_ref() != Some(*m)),
                )
                .cloned()
                .collect()
        };

        for address in candidates {
            let Ok(connection) = self.transport.connect(&address).await else {
                continue;
            };
            match connection.send(request.clone()).await {
                Ok(response) => {
                    self.learn(&response).await;
                    return Some(response);
                }
                Err(error) => {
                    debug!(address = %address, %error, "request failed; trying next member");
                }
            }
        }
        None
    }

    /// Update the leader and member list from a response that carries them.
    async fn learn(&self, response: &Response) {
        let (leader, members) = match response {
            Response::Register(r) => (r.leader.clone(), r.members.clone()),
            Response::KeepAlive(r) => (r.leader.clone(), r.members.clone()),
            Response::Configure(r) => (r.leader.clone(), vec![]),
            _ => return,
        };
        let mut targets = self.targets.lock().await;
        if leader.is_some() {
            targets.leader = leader;
        }
        if !members.is_empty() {
            targets.members = members;
        }
    }

    /// Register a fresh session, retrying across members.
    async fn register(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            let request = Request::Register(RegisterRequest {
                member: self.address.clone(),
            });
            if let Some(Response::Register(response)) = self.send_round(request).await {
                if response.status == Status::Ok {
                    debug!(session = response.session, "session registered");
                    let mut session = self.session.lock().await;
                    session.id = response.session;
                    session.request = 0;
                    session.acknowledged = 0;
                    return Ok(());
                }
                if let Some(error) = response.error {
                    if !error.is_retryable() {
                        return Err(ClientError::Raft(error));
                    }
                }
                self.clear_leader().await;
            }

            attempt += 1;
            if !self.config.retry.allows(attempt) {
                return Err(ClientError::Unavailable(
                    "no server accepted session registration".into(),
                ));
            }
            tokio::time::sleep(self.config.retry.backoff(attempt - 1)).await;
        }
    }
}

/// Keep the session alive until the client is dropped.
fn spawn_keep_alive(inner: Weak<ClientInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = match inner.upgrade() {
            Some(inner) => inner.config.keep_alive_interval,
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let session_id = inner.session.lock().await.id;
            if session_id == 0 {
                continue;
            }
            match inner
                .send_round(Request::KeepAlive(KeepAliveRequest {
                    session: session_id,
                }))
                .await
            {
                Some(Response::KeepAlive(response)) => {
                    if response.error == Some(RaftError::UnknownSession) {
                        warn!(session = session_id, "session expired by the cluster");
                        inner.session.lock().await.id = 0;
                    }
                }
                Some(_) | None => {
                    inner.clear_leader().await;
                }
            }
        }
    })
}

impl Drop for RaftClient {
    fn drop(&mut self) {
        self.keep_alive.abort();
    }
}
