//! Copycat Core Types
//!
//! This crate defines the types shared between the Copycat server, storage,
//! and client crates:
//!
//! 1. **Entries**: The replicated log entry model (no-op, configuration,
//!    session, command, query, and membership entries)
//! 2. **Messages**: Wire requests and responses for the Raft protocol
//! 3. **Codec**: Deterministic big-endian binary encoding with a stable
//!    numeric type-id registry
//! 4. **Members**: Cluster addresses and stable member identifiers
//!
//! ## Design Decisions
//! - Command and query payloads are `bytes::Bytes` so slices of segment
//!   buffers can be handed out without copying
//! - Every entry and message type has a fixed one-byte type id; ids are part
//!   of the on-disk and wire contract and must never be reused
//! - Encoding is hand-rolled over `bytes::{Buf, BufMut}` rather than a serde
//!   format so the layout is deterministic and bit-exact across versions

pub mod codec;
pub mod entry;
pub mod error;
pub mod member;
pub mod message;
pub mod varint;

pub use entry::{Entry, Payload};
pub use error::{Error, Result};
pub use member::{Address, Member, MemberKind};
pub use message::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigureRequest,
    ConfigureResponse, Consistency, KeepAliveRequest, KeepAliveResponse, MembershipChange,
    PollRequest, PollResponse, QueryRequest, QueryResponse, RaftError, RegisterRequest,
    RegisterResponse, Request, Response, Status, VoteRequest, VoteResponse,
};
