//! Copycat Raft Server
//!
//! This crate implements the consensus core of Copycat: a Raft server that
//! replicates a user-supplied state machine over the segmented log from
//! `copycat-storage`.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  Request   ┌─────────────────────────────────┐
//! │ Transport  │──────────▶│ Event loop (one task per server) │
//! └────────────┘            │  Role: Follower / Candidate /   │
//!       ▲                   │        Leader / Passive          │
//!       │ AppendRequest     │  ServerContext: term, log,       │
//!       └───────────────────│  cluster, sessions               │
//!         to peers          └───────────────┬─────────────────┘
//!                                           │ committed entries
//!                                           ▼
//!                            ┌─────────────────────────────────┐
//!                            │ Executor → user StateMachine     │
//!                            └─────────────────────────────────┘
//! ```
//!
//! ## What Lives Where
//!
//! - [`RaftServer`]: the public handle — start, status, shutdown
//! - [`StateMachine`]: the trait users implement; commands arrive exactly
//!   once per session request, queries never mutate
//! - [`Transport`] / [`LocalTransport`]: the wire contract and the
//!   in-process implementation used by tests and the demo binary
//! - [`ServerConfig`]: timeouts, members, storage settings
//!
//! ## Example
//!
//! ```ignore
//! let transport = Arc::new(LocalTransport::new());
//! let config = ServerConfig::new(address, members)
//!     .with_storage(StorageConfig::with_directory("./data/a"));
//! let server = RaftServer::start(config, transport, Box::new(MyMachine::default())).await?;
//! ```

pub mod apply;
pub mod cluster;
pub mod config;
pub mod error;
pub mod replicator;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;

pub use apply::{ApplyOutcome, Commit, Executor, Query, StateMachine};
pub use cluster::Cluster;
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use replicator::{PeerState, Replicator};
pub use server::{RaftServer, RoleKind, ServerStatus};
pub use session::{Session, SessionManager};
pub use state::ServerContext;
pub use transport::{Connection, Listener, LocalTransport, Transport, TransportError};
