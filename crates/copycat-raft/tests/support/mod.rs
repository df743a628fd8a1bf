#![allow(dead_code)]

//! Shared fixtures for the server integration tests: tiny state machines
//! and a harness that runs whole clusters on the in-process transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use copycat_core::{Address, Request, Response};
use copycat_raft::{
    Commit, LocalTransport, Query, RaftServer, RoleKind, ServerConfig, ServerStatus, StateMachine,
    Transport,
};
use copycat_storage::StorageConfig;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

/// A counter that records how many times apply ran, for asserting
/// at-most-once semantics. `increment` bumps and returns the value.
#[derive(Default)]
pub struct CounterMachine {
    value: u64,
}

impl StateMachine for CounterMachine {
    fn apply(&mut self, commit: Commit<'_>) -> Result<Bytes, String> {
        match commit.command {
            b"increment" => {
                self.value += 1;
                Ok(Bytes::from(self.value.to_string()))
            }
            other => Err(format!(
                "unknown command: {}",
                String::from_utf8_lossy(other)
            )),
        }
    }

    fn query(&self, query: Query<'_>) -> Result<Bytes, String> {
        match query.query {
            b"value" => Ok(Bytes::from(self.value.to_string())),
            other => Err(format!(
                "unknown query: {}",
                String::from_utf8_lossy(other)
            )),
        }
    }
}

/// A last-write-wins map: `put k v`, `del k`; queries `get k`, `size`.
/// Tracks which entry last wrote each key so superseded writes are
/// reported dispensable to compaction.
#[derive(Default)]
pub struct KvMachine {
    entries: HashMap<String, String>,
    last_write: HashMap<String, u64>,
}

impl StateMachine for KvMachine {
    fn apply(&mut self, commit: Commit<'_>) -> Result<Bytes, String> {
        let text = std::str::from_utf8(commit.command).map_err(|e| e.to_string())?;
        let mut parts = text.splitn(3, ' ');
        match parts.next() {
            Some("put") => {
                let key = parts.next().ok_or("put requires a key")?;
                let value = parts.next().ok_or("put requires a value")?;
                self.entries.insert(key.to_string(), value.to_string());
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
        let text = std::str::from_utf8(query.query).map_err(|e| e.to_string())?;
        let mut parts = text.splitn(2, ' ');
        match parts.next() {
            Some("get") => {
                let key = parts.next().ok_or("get requires a key")?;
                Ok(self
                    .entries
                    .get(key)
                    .map(|v| Bytes::from(v.clone()))
                    .unwrap_or_default())
            }
            Some("size") => Ok(Bytes::from(self.entries.len().to_string())),
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

pub type MachineFactory = dyn Fn() -> Box<dyn StateMachine>;

/// An in-process cluster of servers sharing one transport.
pub struct TestCluster {
    pub transport: Arc<LocalTransport>,
    pub servers: Vec<RaftServer>,
    pub members: Vec<Address>,
    dirs: Vec<TempDir>,
    config: ServerConfig,
    machine: Box<MachineFactory>,
}

pub const TEST_ELECTION_TIMEOUT: Duration = Duration::from_millis(150);

impl TestCluster {
    /// Start `nodes` voting members with the given state machine factory.
    pub async fn start(
        nodes: u16,
        machine: impl Fn() -> Box<dyn StateMachine> + 'static,
    ) -> TestCluster {
        Self::start_with(nodes, machine, |config| config).await
    }

    pub async fn start_with(
        nodes: u16,
        machine: impl Fn() -> Box<dyn StateMachine> + 'static,
        tweak: impl Fn(ServerConfig) -> ServerConfig,
    ) -> TestCluster {
        let members: Vec<Address> = (0..nodes)
            .map(|i| Address::new("localhost", 5001 + i))
            .collect();
        let transport = Arc::new(LocalTransport::new());
        let template = tweak(
            ServerConfig::new(members[0].clone(), members.clone())
                .with_timing(TEST_ELECTION_TIMEOUT),
        );

        let mut cluster = TestCluster {
            transport,
            servers: Vec::new(),
            members: members.clone(),
            dirs: Vec::new(),
            config: template,
            machine: Box::new(machine),
        };
        for member in members {
            cluster.spawn_member(member).await;
        }
        cluster
    }

    /// Start one server (used for initial members and late joiners alike).
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
        let server = RaftServer::start(config, self.transport.clone(), (self.machine)())
            .await
            .expect("server start");
        self.dirs.push(dir);
        self.servers.push(server);
        self.servers.last().expect("just pushed")
    }

    /// Wait until exactly one live server is leader, asserting along the way
    /// that no two servers ever lead the same term.
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
            let terms: HashSet<u64> = leaders.iter().map(|l| l.term).collect();
            assert_eq!(terms.len(), leaders.len(), "two leaders share a term");
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

    /// Wait until every live server has applied at least `index`.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let mut behind = false;
            for server in &self.servers {
                match server.status().await {
                    Ok(status) if status.last_applied >= index => {}
                    _ => behind = true,
                }
            }
            if !behind {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "replicas did not apply index {index} within {timeout:?}"
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop a server and make its address unreachable.
    pub async fn kill(&mut self, index: usize) -> Address {
        let server = self.servers.remove(index);
        let address = server.address().clone();
        server.shutdown().await.ok();
        self.transport.unbind(&address);
        address
    }

    /// Send a raw protocol request to one address.
    pub async fn send(&self, address: &Address, request: Request) -> Response {
        let connection = self
            .transport
            .connect(address)
            .await
            .expect("connect to test server");
        connection.send(request).await.expect("request completes")
    }
}
