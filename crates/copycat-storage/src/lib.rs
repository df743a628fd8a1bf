//! Copycat Storage Layer
//!
//! This crate implements the segmented append-only log that backs the Raft
//! server: one writable segment plus zero or more sealed read-only segments,
//! each a single file with a fixed descriptor header, CRC-framed entries, and
//! an in-memory offset index for O(log n) index-to-offset lookup.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Log                                           │
//! │  first_index → Segment (sealed)               │
//! │  first_index → Segment (sealed)               │
//! │  first_index → Segment (current, writable)    │
//! └───────────────┬───────────────────────────────┘
//!                 │ per segment
//!                 ▼
//! ┌───────────────────────────────────────────────┐
//! │ [descriptor 64B][frame][frame][frame]...      │
//! │  frame = len | type | body | crc32            │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Durability Rules
//!
//! - A segment's descriptor is written and synced before its locked bit is
//!   set; only locked segments are trusted after a restart
//! - On recovery the valid prefix of each segment is the run of frames whose
//!   length and CRC both check out; everything after the first bad frame is
//!   discarded
//! - Compaction rewrites produce a new file with a bumped version and delete
//!   the old one only after the new file is fully synced; if both survive a
//!   crash, recovery keeps the higher version
//!
//! ## Threading
//!
//! All APIs take `&mut self` and perform synchronous I/O. The log is owned by
//! the server's single context task; nothing here locks except the buffer
//! pool, which hands encode scratch buffers to whoever asks.

pub mod buffer;
pub mod compaction;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod index;
pub mod log;
pub mod segment;

pub use buffer::BufferPool;
pub use compaction::{CompactionConfig, CompactionStats, Compactor};
pub use config::StorageConfig;
pub use descriptor::SegmentDescriptor;
pub use error::{Error, Result};
pub use log::{Log, RewriteStats};
pub use segment::Segment;
