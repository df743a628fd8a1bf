//! Copycat Demo
//!
//! Starts an N-node Copycat cluster on the in-process transport, connects a
//! session client, and runs a few commands and queries against a small
//! key-value state machine. Useful for poking at the system and as living
//! documentation of the wiring.
//!
//! ```text
//! cargo run --bin copycat-demo -- --nodes 3
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use copycat_client::{ClientConfig, RaftClient};
use copycat_core::{Address, Consistency};
use copycat_raft::{Commit, LocalTransport, Query, RaftServer, ServerConfig, StateMachine};
use copycat_storage::StorageConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "copycat-demo", about = "Run a local Copycat cluster")]
struct Args {
    /// Number of voting members.
    #[arg(long, default_value_t = 3)]
    nodes: u16,

    /// First port; node i listens on base_port + i.
    #[arg(long, default_value_t = 5001)]
    base_port: u16,

    /// Directory for the nodes' logs; a temp dir when omitted.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Election timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    election_timeout_ms: u64,
}

/// A keyed map with per-key TTLs. Expiry is driven by the timestamps of
/// applied entries, so every replica evicts identically.
#[derive(Default)]
struct KvStateMachine {
    entries: HashMap<String, KvEntry>,
}

struct KvEntry {
    value: String,
    expires_at: Option<u64>,
}

impl KvStateMachine {
    fn evict(&mut self, now: u64) {
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
    }

    fn live(&self, key: &str, now: u64) -> Option<&KvEntry> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, commit: Commit<'_>) -> std::result::Result<Bytes, String> {
        self.evict(commit.timestamp);
        let text = std::str::from_utf8(commit.command).map_err(|e| e.to_string())?;
        let mut parts = text.splitn(4, ' ');
        match parts.next() {
            Some("put") => {
                let key = parts.next().ok_or("put requires a key")?;
                let value = parts.next().ok_or("put requires a value")?;
                let expires_at = match parts.next() {
                    Some(ttl) => {
                        let ttl: u64 = ttl.parse().map_err(|_| "bad ttl")?;
                        Some(commit.timestamp + ttl)
                    }
                    None => None,
                };
                self.entries.insert(
                    key.to_string(),
                    KvEntry {
                        value: value.to_string(),
                        expires_at,
                    },
                );
                Ok(Bytes::from(value.to_string()))
            }
            Some("del") => {
                let key = parts.next().ok_or("del requires a key")?;
                self.entries.remove(key);
                Ok(Bytes::new())
            }
            Some(other) => Err(format!("unknown command: {other}")),
            None => Err("empty command".into()),
        }
    }

    fn query(&self, query: Query<'_>) -> std::result::Result<Bytes, String> {
        let text = std::str::from_utf8(query.query).map_err(|e| e.to_string())?;
        let mut parts = text.splitn(2, ' ');
        match parts.next() {
            Some("get") => {
                let key = parts.next().ok_or("get requires a key")?;
                Ok(self
                    .live(key, query.timestamp)
                    .map(|e| Bytes::from(e.value.clone()))
                    .unwrap_or_default())
            }
            Some("size") => {
                let count = self
                    .entries
                    .values()
                    .filter(|e| e.expires_at.map_or(true, |at| at > query.timestamp))
                    .count();
                Ok(Bytes::from(count.to_string()))
            }
            Some(other) => Err(format!("unknown query: {other}")),
            None => Err("empty query".into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => std::env::temp_dir().join(format!("copycat-demo-{}", std::process::id())),
    };

    let members: Vec<Address> = (0..args.nodes)
        .map(|i| Address::new("localhost", args.base_port + i))
        .collect();
    let transport = Arc::new(LocalTransport::new());

    let mut servers = Vec::new();
    for member in &members {
        let config = ServerConfig::new(member.clone(), members.clone())
            .with_timing(Duration::from_millis(args.election_timeout_ms))
            .with_storage(StorageConfig::with_directory(
                data_dir.join(member.port.to_string()),
            ));
        let server = RaftServer::start(
            config,
            transport.clone(),
            Box::new(KvStateMachine::default()),
        )
        .await
        .with_context(|| format!("starting {member}"))?;
        servers.push(server);
    }
    info!(nodes = servers.len(), "cluster started");

    let client = RaftClient::connect(transport.clone(), members.clone(), ClientConfig::default())
        .await
        .context("connecting client")?;
    info!(session = client.session_id().await, "session registered");

    let value = client.submit(Bytes::from("put greeting hello")).await?;
    info!(put = %String::from_utf8_lossy(&value), "committed");

    let value = client
        .query(Bytes::from("get greeting"), Consistency::LinearizableStrict)
        .await?;
    info!(get = %String::from_utf8_lossy(&value), "linearizable read");

    let size = client
        .query(Bytes::from("size"), Consistency::Serializable)
        .await?;
    info!(size = %String::from_utf8_lossy(&size), "serializable read");

    for server in &servers {
        let status = server.status().await?;
        info!(
            address = %status.address,
            role = ?status.role,
            term = status.term,
            commit = status.commit_index,
            "node status"
        );
    }

    client.close().await;
    for server in &servers {
        server.shutdown().await.ok();
    }
    Ok(())
}
