//! Offset Index
//!
//! Maps an entry's offset within a segment (`index - first_index`) to the
//! file position and length of its frame. Offsets are appended in strictly
//! ascending order; lookups binary-search. A freshly written segment has
//! consecutive offsets, but compaction rewrites leave holes, so exact-match
//! search is required rather than direct indexing.

/// One indexed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Entry offset relative to the segment's first index.
    pub offset: u32,
    /// File position of the frame's length prefix.
    pub position: u64,
    /// Total frame length in bytes (length prefix through CRC).
    pub length: u32,
}

/// In-memory index over one segment's frames.
#[derive(Debug, Default)]
pub struct OffsetIndex {
    entries: Vec<IndexEntry>,
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame. `offset` must exceed the last recorded offset.
    pub fn push(&mut self, offset: u32, position: u64, length: u32) {
        debug_assert!(
            self.entries.last().map_or(true, |e| offset > e.offset),
            "offsets must be appended in ascending order"
        );
        self.entries.push(IndexEntry {
            offset,
            position,
            length,
        });
    }

    /// Locate the frame for `offset`, if present.
    pub fn find(&self, offset: u32) -> Option<IndexEntry> {
        self.entries
            .binary_search_by_key(&offset, |e| e.offset)
            .ok()
            .map(|i| self.entries[i])
    }

    /// Whether any frame at or after `offset` exists.
    pub fn contains_at_or_after(&self, offset: u32) -> bool {
        self.entries.last().is_some_and(|e| e.offset >= offset)
    }

    /// Number of indexed frames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest recorded offset.
    pub fn last_offset(&self) -> Option<u32> {
        self.entries.last().map(|e| e.offset)
    }

    /// Drop all frames with offsets strictly greater than `offset`, returning
    /// the file position where the dropped region began (for file truncation).
    pub fn truncate(&mut self, offset: u32) -> Option<u64> {
        let cut = self.entries.partition_point(|e| e.offset <= offset);
        if cut == self.entries.len() {
            return None;
        }
        let position = self.entries[cut].position;
        self.entries.truncate(cut);
        Some(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_index(count: u32) -> OffsetIndex {
        let mut index = OffsetIndex::new();
        let mut position = 64u64;
        for offset in 0..count {
            index.push(offset, position, 32);
            position += 32;
        }
        index
    }

    #[test]
    fn test_empty() {
        let index = OffsetIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.find(0), None);
        assert_eq!(index.last_offset(), None);
    }

    #[test]
    fn test_dense_lookup() {
        let index = dense_index(10);
        for offset in 0..10 {
            let entry = index.find(offset).unwrap();
            assert_eq!(entry.position, 64 + offset as u64 * 32);
            assert_eq!(entry.length, 32);
        }
        assert_eq!(index.find(10), None);
        assert_eq!(index.last_offset(), Some(9));
    }

    #[test]
    fn test_sparse_lookup() {
        let mut index = OffsetIndex::new();
        index.push(0, 64, 16);
        index.push(3, 80, 24);
        index.push(7, 104, 48);
        assert!(index.find(0).is_some());
        assert_eq!(index.find(1), None);
        assert_eq!(index.find(3).unwrap().position, 80);
        assert_eq!(index.find(7).unwrap().length, 48);
        assert!(index.contains_at_or_after(4));
        assert!(!index.contains_at_or_after(8));
    }

    #[test]
    fn test_truncate_middle() {
        let mut index = dense_index(10);
        let position = index.truncate(4).unwrap();
        assert_eq!(position, 64 + 5 * 32);
        assert_eq!(index.len(), 5);
        assert_eq!(index.last_offset(), Some(4));
        assert_eq!(index.find(5), None);
    }

    #[test]
    fn test_truncate_past_end_is_noop() {
        let mut index = dense_index(3);
        assert_eq!(index.truncate(10), None);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_truncate_everything() {
        let mut index = dense_index(3);
        let mut sparse = OffsetIndex::new();
        sparse.push(2, 100, 8);
        // offset 0 and 1 are absent; truncating at 1 drops offset 2
        assert_eq!(sparse.truncate(1), Some(100));
        assert!(sparse.is_empty());

        // dense: truncate below the first offset drops all
        let position = index.truncate(0).unwrap();
        assert_eq!(position, 64 + 32);
        assert_eq!(index.len(), 1);
    }
}
