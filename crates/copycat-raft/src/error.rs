//! Server Error Types
//!
//! Internal server errors. These never cross the wire: at the response
//! boundary they are translated to protocol [`RaftError`] codes so clients
//! see a stable error surface regardless of what failed underneath.
//!
//! [`RaftError`]: copycat_core::RaftError

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] copycat_storage::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server is closed")]
    Closed,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}
