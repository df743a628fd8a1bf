//! Segment Descriptor
//!
//! Every segment file begins with a fixed 64-byte descriptor. The layout is
//! bit-exact and versioned:
//!
//! ```text
//! ┌───────┬─────────┬────┬─────────┬─────────────┬─────────┐
//! │ magic │ layout  │ id │ version │ first_index │ updated │
//! │ 4B    │ 2B      │ 8B │ 8B      │ 8B          │ 8B      │
//! └───────┴─────────┴────┴─────────┴─────────────┴─────────┘
//! ┌────────────────┬──────────────────┬─────────────┬────────┬─────┐
//! │ max_entry_size │ max_segment_size │ max_entries │ locked │ pad │
//! │ 4B             │ 4B               │ 4B          │ 1B     │ 13B │
//! └────────────────┴──────────────────┴─────────────┴────────┴─────┘
//! ```
//!
//! `version` counts compaction rewrites of the same logical segment; when
//! two files cover the same first index after a crash, the higher version
//! wins. `locked` is set only after the descriptor has been durably written,
//! so an unlocked file on disk is a partially created segment and is
//! discarded on recovery.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub const SEGMENT_MAGIC: [u8; 4] = *b"CCLG";
pub const LAYOUT_VERSION: u16 = 1;
pub const DESCRIPTOR_SIZE: usize = 64;

/// The fixed header of a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Monotonically increasing segment id within a log.
    pub id: u64,

    /// Rewrite generation; bumped by compaction.
    pub version: u64,

    /// Index of the first entry this segment may hold. Immutable.
    pub first_index: u64,

    /// Milliseconds since epoch of the last seal, 0 until first sealed.
    pub updated: i64,

    pub max_entry_size: u32,
    pub max_segment_size: u32,
    pub max_entries: u32,

    /// Set once the descriptor itself is durable.
    pub locked: bool,
}

impl SegmentDescriptor {
    /// Serialize into the fixed 64-byte header block.
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut block = [0u8; DESCRIPTOR_SIZE];
        let mut buf = &mut block[..];
        buf.put_slice(&SEGMENT_MAGIC);
        buf.put_u16(LAYOUT_VERSION);
        buf.put_u64(self.id);
        buf.put_u64(self.version);
        buf.put_u64(self.first_index);
        buf.put_i64(self.updated);
        buf.put_u32(self.max_entry_size);
        buf.put_u32(self.max_segment_size);
        buf.put_u32(self.max_entries);
        buf.put_u8(u8::from(self.locked));
        block
    }

    /// Parse a 64-byte header block.
    pub fn decode(block: &[u8]) -> Result<SegmentDescriptor> {
        if block.len() < DESCRIPTOR_SIZE {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor block is {} bytes, expected {DESCRIPTOR_SIZE}",
                block.len()
            )));
        }
        let mut buf = &block[..DESCRIPTOR_SIZE];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SEGMENT_MAGIC {
            return Err(Error::InvalidDescriptor("bad magic".into()));
        }
        let layout = buf.get_u16();
        if layout != LAYOUT_VERSION {
            return Err(Error::InvalidDescriptor(format!(
                "unsupported layout version {layout}"
            )));
        }
        Ok(SegmentDescriptor {
            id: buf.get_u64(),
            version: buf.get_u64(),
            first_index: buf.get_u64(),
            updated: buf.get_i64(),
            max_entry_size: buf.get_u32(),
            max_segment_size: buf.get_u32(),
            max_entries: buf.get_u32(),
            locked: buf.get_u8() != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SegmentDescriptor {
        SegmentDescriptor {
            id: 3,
            version: 2,
            first_index: 4097,
            updated: 1_700_000_000_000,
            max_entry_size: 1024 * 1024,
            max_segment_size: 32 * 1024 * 1024,
            max_entries: 1 << 20,
            locked: true,
        }
    }

    #[test]
    fn test_roundtrip() {
        let original = descriptor();
        let block = original.encode();
        assert_eq!(SegmentDescriptor::decode(&block).unwrap(), original);
    }

    #[test]
    fn test_unlocked_roundtrip() {
        let mut original = descriptor();
        original.locked = false;
        original.updated = 0;
        let block = original.encode();
        assert_eq!(SegmentDescriptor::decode(&block).unwrap(), original);
    }

    #[test]
    fn test_block_is_fixed_size() {
        assert_eq!(descriptor().encode().len(), DESCRIPTOR_SIZE);
    }

    #[test]
    fn test_magic_leads_the_block() {
        let block = descriptor().encode();
        assert_eq!(&block[..4], &SEGMENT_MAGIC);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut block = descriptor().encode();
        block[0] = b'X';
        assert!(SegmentDescriptor::decode(&block).is_err());
    }

    #[test]
    fn test_bad_layout_version_rejected() {
        let mut block = descriptor().encode();
        block[4] = 0xFF;
        block[5] = 0xFF;
        assert!(SegmentDescriptor::decode(&block).is_err());
    }

    #[test]
    fn test_short_block_rejected() {
        let block = descriptor().encode();
        assert!(SegmentDescriptor::decode(&block[..32]).is_err());
    }
}
