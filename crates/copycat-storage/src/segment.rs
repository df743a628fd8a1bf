//! Log Segments
//!
//! A segment is one file: a 64-byte descriptor followed by CRC-framed
//! entries. Frames are `length (4B) | type (1B) | body | crc32 (4B)` with the
//! CRC computed over type + body. Within a segment entry indexes are strictly
//! ascending; a freshly written segment is dense, a compacted one may have
//! holes.
//!
//! ## Recovery
//!
//! `Segment::open` scans frames from the front and stops at the first short
//! read, implausible length, CRC mismatch, or out-of-order index. The file is
//! truncated back to the end of the last good frame, so a torn tail write
//! never resurfaces after restart.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use copycat_core::Entry;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::descriptor::{SegmentDescriptor, DESCRIPTOR_SIZE};
use crate::error::{Error, Result};
use crate::index::OffsetIndex;

/// Frame overhead: length prefix plus trailing CRC.
const FRAME_OVERHEAD: u64 = 8;

/// A single segment file plus its in-memory offset index.
pub struct Segment {
    descriptor: SegmentDescriptor,
    path: PathBuf,
    file: File,
    index: OffsetIndex,
    /// Next write position; also the end of the valid prefix.
    size: u64,
}

impl Segment {
    /// The file name for a segment: `<log-name>-<id>-<version>.log`.
    pub fn file_name(name: &str, id: u64, version: u64) -> String {
        format!("{name}-{id}-{version}.log")
    }

    /// Parse `<log-name>-<id>-<version>.log`, returning `(id, version)`.
    /// Names that do not match the pattern are ignored by recovery.
    pub fn parse_file_name(name: &str, file_name: &str) -> Option<(u64, u64)> {
        let rest = file_name.strip_prefix(name)?.strip_prefix('-')?;
        let rest = rest.strip_suffix(".log")?;
        let (id, version) = rest.split_once('-')?;
        Some((id.parse().ok()?, version.parse().ok()?))
    }

    /// Create a new segment file. The descriptor is written and synced
    /// unlocked first; the locked bit is set only once that write is durable,
    /// so recovery can distinguish a fully created segment from a torn one.
    pub fn create(directory: &Path, name: &str, mut descriptor: SegmentDescriptor) -> Result<Self> {
        let path = directory.join(Self::file_name(name, descriptor.id, descriptor.version));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        descriptor.locked = false;
        file.write_all(&descriptor.encode())?;
        file.sync_all()?;

        descriptor.locked = true;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&descriptor.encode())?;
        file.sync_all()?;

        debug!(
            path = %path.display(),
            id = descriptor.id,
            version = descriptor.version,
            first_index = descriptor.first_index,
            "created segment"
        );

        Ok(Self {
            descriptor,
            path,
            file,
            index: OffsetIndex::new(),
            size: DESCRIPTOR_SIZE as u64,
        })
    }

    /// Open an existing segment file, rebuilding the offset index from the
    /// valid frame prefix.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; DESCRIPTOR_SIZE];
        file.read_exact(&mut header)
            .map_err(|_| Error::corruption(format!("{}: short descriptor", path.display())))?;
        let descriptor = SegmentDescriptor::decode(&header)?;

        let mut segment = Self {
            descriptor,
            path: path.to_path_buf(),
            file,
            index: OffsetIndex::new(),
            size: DESCRIPTOR_SIZE as u64,
        };
        segment.rebuild_index()?;
        Ok(segment)
    }

    /// Scan frames from the front, stopping at the first invalid frame and
    /// truncating the file back to the end of the valid prefix.
    fn rebuild_index(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut position = DESCRIPTOR_SIZE as u64;
        let mut last_index: Option<u64> = None;

        self.file.seek(SeekFrom::Start(position))?;
        loop {
            match self.read_frame_at(position, file_len, last_index) {
                Ok(Some((entry_index, frame_len))) => {
                    let offset = (entry_index - self.descriptor.first_index) as u32;
                    self.index.push(offset, position, frame_len as u32);
                    position += frame_len;
                    last_index = Some(entry_index);
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        position,
                        %error,
                        "discarding segment tail"
                    );
                    break;
                }
            }
        }

        if position < file_len {
            self.file.set_len(position)?;
            self.file.sync_all()?;
        }
        self.size = position;

        debug!(
            path = %self.path.display(),
            entries = self.index.len(),
            size = self.size,
            "opened segment"
        );
        Ok(())
    }

    /// Read and validate one frame at `position`. Returns `Ok(None)` at the
    /// clean end of the valid prefix, `Err` when the tail is torn.
    fn read_frame_at(
        &mut self,
        position: u64,
        file_len: u64,
        last_index: Option<u64>,
    ) -> Result<Option<(u64, u64)>> {
        if position + 4 > file_len {
            // Either a clean end or a few stray bytes; both end the prefix.
            if position == file_len {
                return Ok(None);
            }
            return Err(Error::corruption("trailing bytes shorter than a frame"));
        }

        self.file.seek(SeekFrom::Start(position))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let length = u32::from_be_bytes(len_buf) as u64;

        if length < 17 || length > self.descriptor.max_entry_size as u64 + 1 {
            return Err(Error::corruption(format!("implausible frame length {length}")));
        }
        if position + 4 + length + 4 > file_len {
            return Err(Error::corruption("frame extends past end of file"));
        }

        let mut frame = vec![0u8; length as usize + 4];
        self.file.read_exact(&mut frame)?;
        let (payload, crc_bytes) = frame.split_at(length as usize);
        let stored_crc = u32::from_be_bytes(crc_bytes.try_into().expect("4-byte crc"));
        if crc32fast::hash(payload) != stored_crc {
            return Err(Error::corruption("crc mismatch"));
        }

        let type_id = payload[0];
        let mut body = &payload[1..];
        let entry = Entry::decode_body(type_id, &mut body)?;

        if entry.index < self.descriptor.first_index {
            return Err(Error::corruption(format!(
                "entry index {} below segment first index {}",
                entry.index, self.descriptor.first_index
            )));
        }
        if let Some(last) = last_index {
            if entry.index <= last {
                return Err(Error::corruption(format!(
                    "entry index {} not ascending after {last}",
                    entry.index
                )));
            }
        }

        Ok(Some((entry.index, 4 + length + 4)))
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn version(&self) -> u64 {
        self.descriptor.version
    }

    pub fn first_index(&self) -> u64 {
        self.descriptor.first_index
    }

    /// Index of the newest entry, or `first_index - 1` when empty.
    pub fn last_index(&self) -> u64 {
        match self.index.last_offset() {
            Some(offset) => self.descriptor.first_index + offset as u64,
            None => self.descriptor.first_index - 1,
        }
    }

    pub fn next_index(&self) -> u64 {
        self.last_index() + 1
    }

    /// Number of entries physically present.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes written, descriptor included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the segment has reached a rollover threshold.
    pub fn is_full(&self) -> bool {
        self.index.len() as u32 >= self.descriptor.max_entries
            || self.size >= self.descriptor.max_segment_size as u64
    }

    /// Whether `index` falls inside this segment's logical range.
    pub fn covers(&self, index: u64) -> bool {
        index >= self.descriptor.first_index && index <= self.last_index()
    }

    /// Append an entry. The index must ascend; gaps are legal (compaction
    /// rewrites produce them) but the log never appends out of order.
    pub fn append(&mut self, entry: &Entry, pool: &BufferPool) -> Result<()> {
        if entry.index < self.descriptor.first_index {
            return Err(Error::corruption(format!(
                "entry index {} below segment first index {}",
                entry.index, self.descriptor.first_index
            )));
        }
        if !self.is_empty() && entry.index <= self.last_index() {
            return Err(Error::OutOfOrder {
                index: entry.index,
                last: self.last_index(),
            });
        }

        let mut body = pool.acquire();
        entry.encode_body(&mut body);
        let length = 1 + body.len();
        if length > self.descriptor.max_entry_size as usize {
            pool.release(body);
            return Err(Error::EntryTooLarge {
                size: length,
                limit: self.descriptor.max_entry_size,
            });
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[entry.type_id()]);
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut frame = pool.acquire();
        frame.put_u32(length as u32);
        frame.put_u8(entry.type_id());
        frame.put_slice(&body);
        frame.put_u32(crc);

        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(&frame)?;

        let frame_len = frame.len() as u64;
        pool.release(body);
        pool.release(frame);

        let offset = (entry.index - self.descriptor.first_index) as u32;
        self.index.push(offset, self.size, frame_len as u32);
        self.size += frame_len;
        Ok(())
    }

    /// Read the entry at `index`. Returns `None` for indexes outside the
    /// segment or removed by compaction.
    pub fn get(&mut self, index: u64) -> Result<Option<Entry>> {
        if index < self.descriptor.first_index {
            return Ok(None);
        }
        let offset = match u32::try_from(index - self.descriptor.first_index) {
            Ok(offset) => offset,
            Err(_) => return Ok(None),
        };
        let Some(slot) = self.index.find(offset) else {
            return Ok(None);
        };

        self.file.seek(SeekFrom::Start(slot.position))?;
        let mut frame = vec![0u8; slot.length as usize];
        self.file.read_exact(&mut frame)?;

        let mut buf = &frame[..];
        let length = buf.get_u32() as usize;
        if length + FRAME_OVERHEAD as usize != slot.length as usize {
            return Err(Error::corruption("frame length disagrees with index"));
        }
        let (payload, crc_bytes) = buf.split_at(length);
        let stored_crc = u32::from_be_bytes(crc_bytes.try_into().expect("4-byte crc"));
        if crc32fast::hash(payload) != stored_crc {
            return Err(Error::corruption("crc mismatch on read"));
        }

        let type_id = payload[0];
        let mut body = &payload[1..];
        let entry = Entry::decode_body(type_id, &mut body)?;
        if entry.index != index {
            return Err(Error::corruption(format!(
                "entry at offset {offset} has index {}, expected {index}",
                entry.index
            )));
        }
        Ok(Some(entry))
    }

    /// Drop all entries with indexes strictly greater than `index`, shrinking
    /// the file to match.
    pub fn truncate(&mut self, index: u64) -> Result<()> {
        let position = if index < self.descriptor.first_index {
            if self.is_empty() {
                return Ok(());
            }
            Some(DESCRIPTOR_SIZE as u64)
        } else {
            let offset = (index - self.descriptor.first_index).min(u32::MAX as u64) as u32;
            self.index.truncate(offset)
        };

        if let Some(position) = position {
            if index < self.descriptor.first_index {
                self.index = OffsetIndex::new();
            }
            self.file.set_len(position)?;
            self.file.sync_all()?;
            self.size = position;
        }
        Ok(())
    }

    /// Record a seal: update the descriptor timestamp and sync everything.
    pub fn seal(&mut self, updated: i64) -> Result<()> {
        self.descriptor.updated = updated;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.descriptor.encode())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flush written frames to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Delete the backing file.
    pub fn delete(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "deleted segment");
        Ok(())
    }

    /// All entries physically present, in index order. Used by compaction
    /// rewrites and tests.
    pub fn entries(&mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(self.index.len());
        let first = self.descriptor.first_index;
        let last = self.last_index();
        let mut index = first;
        while index <= last && !self.is_empty() {
            if let Some(entry) = self.get(index)? {
                entries.push(entry);
            }
            index += 1;
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.descriptor.id)
            .field("version", &self.descriptor.version)
            .field("first_index", &self.descriptor.first_index)
            .field("entries", &self.index.len())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copycat_core::Payload;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn descriptor(id: u64, version: u64, first_index: u64) -> SegmentDescriptor {
        SegmentDescriptor {
            id,
            version,
            first_index,
            updated: 0,
            max_entry_size: 1024,
            max_segment_size: 64 * 1024,
            max_entries: 128,
            locked: true,
        }
    }

    fn command(index: u64, term: u64, payload: &str) -> Entry {
        Entry::new(
            index,
            term,
            Payload::Command {
                session: 1,
                request: index,
                response: 0,
                timestamp: index * 10,
                command: Bytes::from(payload.to_string()),
            },
        )
    }

    #[test]
    fn test_create_and_append() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 1)).unwrap();

        assert!(segment.is_empty());
        assert_eq!(segment.last_index(), 0);
        assert_eq!(segment.next_index(), 1);

        for i in 1..=5 {
            segment.append(&command(i, 1, "payload"), &pool).unwrap();
        }
        assert_eq!(segment.len(), 5);
        assert_eq!(segment.last_index(), 5);
        assert!(segment.covers(3));
        assert!(!segment.covers(6));
    }

    #[test]
    fn test_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 10)).unwrap();

        let entry = command(10, 2, "hello world");
        segment.append(&entry, &pool).unwrap();
        assert_eq!(segment.get(10).unwrap(), Some(entry));
        assert_eq!(segment.get(9).unwrap(), None);
        assert_eq!(segment.get(11).unwrap(), None);
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 1)).unwrap();
        segment.append(&command(1, 1, "a"), &pool).unwrap();
        assert!(matches!(
            segment.append(&command(1, 1, "b"), &pool),
            Err(Error::OutOfOrder { .. })
        ));
        assert!(segment.append(&command(0, 1, "c"), &pool).is_err());
    }

    #[test]
    fn test_append_rejects_oversized_entry() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 1)).unwrap();
        let big = "x".repeat(2048);
        assert!(matches!(
            segment.append(&command(1, 1, &big), &pool),
            Err(Error::EntryTooLarge { .. })
        ));
        assert!(segment.is_empty());
    }

    #[test]
    fn test_gapped_appends_for_compaction() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut segment = Segment::create(dir.path(), "test", descriptor(1, 2, 1)).unwrap();
        segment.append(&command(1, 1, "a"), &pool).unwrap();
        segment.append(&command(4, 1, "d"), &pool).unwrap();
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.last_index(), 4);
        assert_eq!(segment.get(2).unwrap(), None);
        assert!(segment.get(4).unwrap().is_some());
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 1)).unwrap();
        for i in 1..=10 {
            segment.append(&command(i, 1, "x"), &pool).unwrap();
        }
        segment.truncate(6).unwrap();
        assert_eq!(segment.last_index(), 6);
        assert_eq!(segment.get(7).unwrap(), None);
        assert!(segment.get(6).unwrap().is_some());

        // Appends continue after the truncation point.
        segment.append(&command(7, 2, "y"), &pool).unwrap();
        assert_eq!(segment.last_index(), 7);
    }

    #[test]
    fn test_truncate_below_first_clears_segment() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut segment = Segment::create(dir.path(), "test", descriptor(2, 1, 10)).unwrap();
        for i in 10..=12 {
            segment.append(&command(i, 1, "x"), &pool).unwrap();
        }
        segment.truncate(9).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.next_index(), 10);
    }

    #[test]
    fn test_reopen_preserves_entries() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let path;
        {
            let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 1)).unwrap();
            for i in 1..=20 {
                segment.append(&command(i, 3, "persisted"), &pool).unwrap();
            }
            segment.sync().unwrap();
            path = segment.path().to_path_buf();
        }

        let mut segment = Segment::open(&path).unwrap();
        assert_eq!(segment.len(), 20);
        assert_eq!(segment.last_index(), 20);
        assert_eq!(segment.get(13).unwrap(), Some(command(13, 3, "persisted")));
    }

    #[test]
    fn test_reopen_discards_torn_tail() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let path;
        let good_len;
        {
            let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 1)).unwrap();
            for i in 1..=3 {
                segment.append(&command(i, 1, "good"), &pool).unwrap();
            }
            segment.sync().unwrap();
            good_len = segment.size();
            path = segment.path().to_path_buf();
        }

        // Simulate a torn write: a frame header promising more than exists.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 0, 50, 0x05, 1, 2, 3]).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let mut segment = Segment::open(&path).unwrap();
        assert_eq!(segment.len(), 3);
        assert_eq!(segment.size(), good_len);
        assert!(segment.get(3).unwrap().is_some());
    }

    #[test]
    fn test_reopen_discards_corrupt_crc() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let path;
        {
            let mut segment = Segment::create(dir.path(), "test", descriptor(1, 1, 1)).unwrap();
            for i in 1..=3 {
                segment.append(&command(i, 1, "abcdef"), &pool).unwrap();
            }
            segment.sync().unwrap();
            path = segment.path().to_path_buf();
        }

        // Flip a byte in the last frame's body.
        let len = std::fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(len - 6)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let segment = Segment::open(&path).unwrap();
        // The corrupted third frame is discarded; the first two survive.
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.last_index(), 2);
    }

    #[test]
    fn test_file_name_roundtrip() {
        let file_name = Segment::file_name("raft", 7, 3);
        assert_eq!(file_name, "raft-7-3.log");
        assert_eq!(Segment::parse_file_name("raft", &file_name), Some((7, 3)));
        assert_eq!(Segment::parse_file_name("raft", "raft-7.log"), None);
        assert_eq!(Segment::parse_file_name("raft", "other-7-3.log"), None);
        assert_eq!(Segment::parse_file_name("raft", "raft-7-3.tmp"), None);
    }

    #[test]
    fn test_is_full_by_entries() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::default();
        let mut desc = descriptor(1, 1, 1);
        desc.max_entries = 3;
        let mut segment = Segment::create(dir.path(), "test", desc).unwrap();
        for i in 1..=3 {
            assert!(!segment.is_full());
            segment.append(&command(i, 1, "x"), &pool).unwrap();
        }
        assert!(segment.is_full());
    }
}
