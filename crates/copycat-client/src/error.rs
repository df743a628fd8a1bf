//! Client Error Types

use copycat_core::RaftError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The cluster reported a non-retryable protocol error.
    #[error("cluster error: {0}")]
    Raft(RaftError),

    /// No server produced a usable response within the retry budget.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}
