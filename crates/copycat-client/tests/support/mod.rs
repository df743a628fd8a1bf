#![allow(dead_code)]

//! Fixtures for client integration tests: a TTL-aware key-value state
//! machine and an in-process cluster harness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use copycat_core::Address;
use copycat_raft::{
    Commit, LocalTransport, Query, RaftServer, RoleKind, ServerConfig, ServerStatus, StateMachine,
};
use copycat_storage::StorageConfig;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

/// A keyed map with optional per-key TTLs, expired against applied-entry
/// timestamps. Commands: `put k v [ttl_ms]`, `del k`. Queries: `get k`,
/// `size`.
#[derive(Default)]
pub struct TtlKvMachine {
    entries: HashMap<String, TtlEntry>,
    last_write: HashMap<String, u64>,
}

struct TtlEntry {
    value: String,
    expires_at: Option<u64>,
}

impl TtlKvMachine {
    fn is_live(entry: &TtlEntry, now: u64) -> bool {
        entry.expires_at.map_or(true, |at| at > now)
    }
}

impl StateMachine for TtlKvMachine {
    fn apply(&mut self, commit: Commit<'_>) -> Result<Bytes, String> {
        let now = commit.timestamp;
        self.entries.retain(|_, e| Self::is_live(e, now));

        let text = std::str::from_utf8(commit.command).map_err(|e| e.to_string())?;
        let mut parts = text.splitn(4, ' ');
        match parts.next() {
            Some("put") => {
                let key = parts.next().ok_or("put requires a key")?;
                let value = parts.next().ok_or("put requires a value")?;
                let expires_at = match parts.next() {
                    Some(ttl) => Some(now + ttl.parse::<u64>().map_err(|_| "bad ttl")?),
                    None => None,
                };
                self.entries.insert(
                    key.to_string(),
                    TtlEntry {
                        value: value.to_string(),
                        expires_at,
                    },
                );
                self.last_write.insert(key.to_string(), commit.index);
                Ok(Bytes::from(value.to_string()))
            }
            Some("del") => {
                let key = parts.next().ok_or("del requires a key")?;
                self.entries.remove(key);
                self.last_write.insert(key.to_string(), commit.index);
                Ok(Bytes::new())
            }
            Some(other) => Err(format!("unknown command: {other}")),
            None => Err("empty command".into()),
        }
    }

    fn query(&self, query: Query<'_>) -> Result<Bytes, String> {
        let now = query.timestamp;
        let text = std::str::from_utf8(query.query).map_err(|e| e.to_string())?;
        let mut parts = text.splitn(2, ' ');
        match parts.next() {
            Some("get") => {
                let key = parts.next().ok_or("get requires a key")?;
                Ok(self
                    .entries
                    .get(key)
                    .filter(|e| Self::is_live(e, now))
                    .map(|e| Bytes::from(e.value.clone()))
                    .unwrap_or_default())
            }
            Some("size") => {
                let live = self
                    .entries
                    .values()
                    .filter(|e| Self::is_live(e, now))
                    .count();
                Ok(Bytes::from(live.to_string()))
            }
            Some(other) => Err(format!("unknown query: {other}")),
            None => Err("empty query".into()),
        }
    }

    fn retain(&self, index: u64, command: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(command) else {
            return true;
        };
        let Some(key) = text.split(' ').nth(1) else {
            return true;
        };
        self.last_write.get(key) == Some(&index)
    }
}

pub const TEST_ELECTION_TIMEOUT: Duration = Duration::from_millis(150);

/// An in-process cluster sharing one transport.
pub struct TestCluster {
    pub transport: Arc<LocalTransport>,
    pub servers: Vec<RaftServer>,
    pub members: Vec<Address>,
    dirs: Vec<TempDir>,
    config: ServerConfig,
}

impl TestCluster {
    pub async fn start(nodes: u16) -> TestCluster {
        Self::start_with(nodes, |config| config).await
    }

    pub async fn start_with(
        nodes: u16,
        tweak: impl Fn(ServerConfig) -> ServerConfig,
    ) -> TestCluster {
        let members: Vec<Address> = (0..nodes)
            .map(|i| Address::new("localhost", 5001 + i))
            .collect();
        let template = tweak(
            ServerConfig::new(members[0].clone(), members.clone())
                .with_timing(TEST_ELECTION_TIMEOUT),
        );

        let mut cluster = TestCluster {
            transport: Arc::new(LocalTransport::new()),
            servers: Vec::new(),
            members: members.clone(),
            dirs: Vec::new(),
            config: template,
        };
        for member in members {
            cluster.spawn_member(member).await;
        }
        cluster
    }

    pub async fn spawn_member(&mut self, address: Address) -> &RaftServer {
        let dir = TempDir::new().expect("tempdir");
        let config = ServerConfig {
            address: address.clone(),
            storage: StorageConfig {
                directory: dir.path().to_path_buf(),
                ..self.config.storage.clone()
            },
            ..self.config.clone()
        };
        let server = RaftServer::start(
            config,
            self.transport.clone(),
            Box::<TtlKvMachine>::default(),
        )
        .await
        .expect("server start");
        self.dirs.push(dir);
        self.servers.push(server);
        self.servers.last().expect("just pushed")
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> ServerStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let mut leaders = Vec::new();
            for server in &self.servers {
                if let Ok(status) = server.status().await {
                    if status.role == RoleKind::Leader {
                        leaders.push(status);
                    }
                }
            }
            if leaders.len() == 1 {
                return leaders.remove(0);
            }
            assert!(
                Instant::now() < deadline,
                "no single leader within {timeout:?}"
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn kill(&mut self, index: usize) -> Address {
        let server = self.servers.remove(index);
        let address = server.address().clone();
        server.shutdown().await.ok();
        self.transport.unbind(&address);
        address
    }

    /// Poll one server's status until `predicate` holds.
    pub async fn wait_for_status(
        &self,
        index: usize,
        timeout: Duration,
        predicate: impl Fn(&ServerStatus) -> bool,
    ) -> ServerStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(status) = self.servers[index].status().await {
                if predicate(&status) {
                    return status;
                }
            }
            assert!(
                Instant::now() < deadline,
                "server {index} did not reach the expected state within {timeout:?}"
            );
            sleep(Duration::from_millis(20)).await;
        }
    }
}

/// A client config tuned to the test cluster's fast timings.
pub fn test_client_config() -> copycat_client::ClientConfig {
    copycat_client::ClientConfig {
        keep_alive_interval: Duration::from_millis(40),
        retry: copycat_client::RetryPolicy {
            max_retries: 12,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        },
    }
}
