//! Storage Error Types
//!
//! All storage operations return `Result<T>` aliased to this crate's
//! `Error`. I/O failures on the write path are fatal to the server (it
//! cannot continue safely without its log); the server crate makes that
//! call, not this one.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] copycat_core::Error),

    #[error("corrupt segment: {0}")]
    Corruption(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("entry of {size} bytes exceeds max entry size {limit}")]
    EntryTooLarge { size: usize, limit: u32 },

    #[error("index {index} out of order: expected greater than {last}")]
    OutOfOrder { index: u64, last: u64 },
}

impl Error {
    pub fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption(message.into())
    }
}
