//! Core Error Types
//!
//! Errors raised while encoding or decoding entries and wire messages.
//! Protocol-level error codes returned to clients are a separate concern;
//! see [`crate::message::RaftError`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown type id: {0:#04x}")]
    UnknownType(u8),

    #[error("frame truncated: needed {needed} more bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid frame: {0}")]
    Invalid(String),
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Invalid(message.into())
    }
}
