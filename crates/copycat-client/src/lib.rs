//! Copycat Client
//!
//! The client side of a Copycat cluster: the "remote" member state. A
//! [`RaftClient`] locates the leader by trial over the member list,
//! registers a session, keeps it alive in the background, and submits
//! commands and queries with the sequence numbers that give commands
//! at-most-once semantics.
//!
//! ## Failure Handling
//!
//! - `NO_LEADER` and commit failures: retry with exponential backoff,
//!   rediscovering the leader from whichever server answers
//! - `UNKNOWN_SESSION`: the session expired; a new one is registered and
//!   the command is resubmitted under it
//! - Application errors: surfaced to the caller, never retried
//!
//! Retrying a command reuses its request sequence number, so a command
//! that actually committed before the response was lost is replayed from
//! the session's response cache rather than applied twice.

pub mod client;
pub mod error;
pub mod retry;

pub use client::{ClientConfig, RaftClient};
pub use error::{ClientError, Result};
pub use retry::RetryPolicy;
