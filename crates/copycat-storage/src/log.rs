//! The Segmented Log
//!
//! Orders segments by first index, owns the single writable (current)
//! segment, and handles rollover, lookup, truncation, commit tracking, and
//! startup reconciliation.
//!
//! ## Invariants
//! - Exactly one segment is current: the one with the greatest first index
//! - `last_index` always equals the current segment's last index
//! - Segment ranges never overlap after reconciliation; gaps can exist below
//!   the first retained entry of a compacted segment and lookups inside them
//!   return `None`
//! - `commit_index` is advisory here (compaction bound); advancement rules
//!   live in the Raft layer
//!
//! ## Startup Reconciliation
//!
//! `Log::open` scans the directory for `<name>-<id>-<version>.log` files,
//! ignores anything else, discards unlocked segments (torn creations), and
//! when two files cover overlapping ranges keeps the higher version. That
//! last rule is what makes compaction crash-safe: the rewrite is complete on
//! disk before the superseded file is deleted, and recovery finishes the
//! deletion if the process died in between.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use copycat_core::{Entry, Payload};
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::config::StorageConfig;
use crate::descriptor::SegmentDescriptor;
use crate::error::{Error, Result};
use crate::segment::Segment;

/// Statistics from one compaction rewrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewriteStats {
    pub entries_before: u64,
    pub entries_after: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// The segmented append-only log.
pub struct Log {
    directory: PathBuf,
    name: String,
    config: StorageConfig,
    pool: BufferPool,
    /// All segments keyed by first index; the greatest key is current.
    segments: BTreeMap<u64, Segment>,
    commit_index: u64,
    next_segment_id: u64,
}

impl Log {
    /// Open (or create) the log named `name` under the configured directory,
    /// reconciling whatever segment files survive there.
    pub fn open(name: &str, config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;

        let mut candidates: Vec<Segment> = Vec::new();
        for dir_entry in std::fs::read_dir(&config.directory)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if Segment::parse_file_name(name, file_name).is_none() {
                continue;
            }
            let path = dir_entry.path();
            match Segment::open(&path) {
                Ok(segment) if segment.descriptor().locked => candidates.push(segment),
                Ok(segment) => {
                    warn!(path = %path.display(), "discarding unlocked segment");
                    segment.delete()?;
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "discarding unreadable segment");
                    std::fs::remove_file(&path)?;
                }
            }
        }

        // Higher versions supersede overlapping lower versions.
        candidates.sort_by_key(|s| (s.first_index(), std::cmp::Reverse(s.version())));
        let mut segments: BTreeMap<u64, Segment> = BTreeMap::new();
        let mut next_segment_id = 1u64;
        let mut last_kept: Option<u64> = None;
        for segment in candidates {
            next_segment_id = next_segment_id.max(segment.id() + 1);
            let overlaps = last_kept.is_some_and(|last| segment.first_index() <= last);
            if overlaps {
                let kept = segments
                    .values()
                    .last()
                    .expect("overlap implies a kept segment");
                if segment.version() > kept.version() {
                    let first = kept.first_index();
                    let superseded = segments.remove(&first).expect("kept segment present");
                    info!(
                        old = %superseded.path().display(),
                        new = %segment.path().display(),
                        "newer segment version supersedes overlapping segment"
                    );
                    superseded.delete()?;
                    last_kept = Some(segment.last_index());
                    segments.insert(segment.first_index(), segment);
                } else {
                    info!(path = %segment.path().display(), "deleting superseded segment");
                    segment.delete()?;
                }
                continue;
            }
            if let Some(last) = last_kept {
                if segment.first_index() > last + 1 {
                    debug!(
                        from = last + 1,
                        to = segment.first_index() - 1,
                        "gap between segments; lookups in the gap return no entry"
                    );
                }
            }
            last_kept = Some(segment.last_index());
            segments.insert(segment.first_index(), segment);
        }

        let mut log = Self {
            directory: config.directory.clone(),
            name: name.to_string(),
            config,
            pool: BufferPool::default(),
            segments,
            commit_index: 0,
            next_segment_id,
        };

        if log.segments.is_empty() {
            log.create_segment(1)?;
        }

        info!(
            name,
            segments = log.segments.len(),
            first_index = log.first_index(),
            last_index = log.last_index(),
            "log opened"
        );
        Ok(log)
    }

    fn create_segment(&mut self, first_index: u64) -> Result<()> {
        let descriptor = SegmentDescriptor {
            id: self.next_segment_id,
            version: 1,
            first_index,
            updated: 0,
            max_entry_size: self.config.max_entry_size,
            max_segment_size: self.config.max_segment_size,
            max_entries: self.config.max_entries_per_segment,
            locked: true,
        };
        let segment = Segment::create(&self.directory, &self.name, descriptor)?;
        self.next_segment_id += 1;
        self.segments.insert(first_index, segment);
        Ok(())
    }

    fn current(&self) -> &Segment {
        self.segments.values().last().expect("log has a segment")
    }

    fn current_mut(&mut self) -> &mut Segment {
        self.segments
            .values_mut()
            .last()
            .expect("log has a segment")
    }

    /// Index of the oldest entry, or 0 when the log is empty.
    pub fn first_index(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.segments
            .values()
            .find(|s| !s.is_empty())
            .map(Segment::first_index)
            .unwrap_or(0)
    }

    /// Index of the newest entry, or 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.current().last_index()
    }

    /// The index the next appended entry will take.
    pub fn next_index(&self) -> u64 {
        self.current().next_index()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.values().all(Segment::is_empty)
    }

    /// Whether `index` falls inside the log's logical range. Entries inside
    /// the range may still have been removed by compaction.
    pub fn contains_index(&self, index: u64) -> bool {
        index > 0 && !self.is_empty() && index >= self.first_index() && index <= self.last_index()
    }

    /// Build an entry for the next slot. The caller appends it (possibly
    /// after setting payload fields) via [`Log::append`].
    pub fn create(&self, term: u64, payload: Payload) -> Entry {
        Entry::new(self.next_index(), term, payload)
    }

    /// Append an entry at the next index, rolling the segment if full.
    pub fn append(&mut self, entry: &Entry) -> Result<u64> {
        let expected = self.next_index();
        if entry.index != expected {
            return Err(Error::OutOfOrder {
                index: entry.index,
                last: expected - 1,
            });
        }

        if self.current().is_full() {
            self.roll()?;
        }

        let pool = &self.pool;
        self.segments
            .values_mut()
            .last()
            .expect("log has a segment")
            .append(entry, pool)?;
        Ok(entry.index)
    }

    /// Append a replicated entry. Unlike [`Log::append`], gaps are legal: a
    /// leader replicating from a compacted log sends only retained entries,
    /// and the follower's log mirrors the holes.
    pub fn append_replica(&mut self, entry: &Entry) -> Result<u64> {
        let last = self.last_index();
        if !self.is_empty() && entry.index <= last {
            return Err(Error::OutOfOrder {
                index: entry.index,
                last,
            });
        }

        if self.current().is_full() {
            self.roll()?;
        }

        let pool = &self.pool;
        self.segments
            .values_mut()
            .last()
            .expect("log has a segment")
            .append(entry, pool)?;
        Ok(entry.index)
    }

    /// Seal the current segment and start a new one.
    fn roll(&mut self) -> Result<()> {
        let next_first = self.current().next_index();
        self.current_mut().seal(now_ms())?;
        debug!(
            first_index = next_first,
            id = self.next_segment_id,
            "rolling to new segment"
        );
        self.create_segment(next_first)
    }

    /// Read the entry at `index`. Returns `None` outside the log's range and
    /// for entries removed by compaction.
    pub fn get(&mut self, index: u64) -> Result<Option<Entry>> {
        if index == 0 {
            return Ok(None);
        }
        let Some((_, segment)) = self.segments.range_mut(..=index).next_back() else {
            return Ok(None);
        };
        if index > segment.last_index() {
            return Ok(None);
        }
        segment.get(index)
    }

    /// The term of the entry at `index`, if present.
    pub fn term(&mut self, index: u64) -> Result<Option<u64>> {
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// The term of the newest entry, or 0 for an empty log.
    pub fn last_term(&mut self) -> Result<u64> {
        let last = self.last_index();
        Ok(self.term(last)?.unwrap_or(0))
    }

    /// Drop all entries strictly greater than `index`. Whole segments above
    /// the cut are deleted; the containing segment is shortened in place.
    pub fn truncate(&mut self, index: u64) -> Result<()> {
        if index >= self.last_index() {
            return Ok(());
        }
        debug_assert!(
            index >= self.commit_index,
            "must not truncate committed entries"
        );

        let removed: Vec<u64> = self
            .segments
            .range(index + 1..)
            .map(|(first, _)| *first)
            .collect();
        for first in removed {
            let segment = self.segments.remove(&first).expect("segment present");
            segment.delete()?;
        }

        if let Some((_, segment)) = self.segments.range_mut(..=index.max(1)).next_back() {
            segment.truncate(index)?;
        }

        if self.segments.is_empty() {
            self.create_segment(index + 1)?;
        }

        debug!(index, last_index = self.last_index(), "truncated log");
        Ok(())
    }

    /// Advance the advisory commit index. Monotonic, clamped to the log.
    pub fn commit(&mut self, index: u64) {
        self.commit_index = self.commit_index.max(index.min(self.last_index()));
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Flush the current segment to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.current_mut().sync()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Entries physically present across all segments.
    pub fn entry_count(&self) -> u64 {
        self.segments.values().map(|s| s.len() as u64).sum()
    }

    /// Bytes on disk across all segments, descriptors included.
    pub fn size_bytes(&self) -> u64 {
        self.segments.values().map(Segment::size).sum()
    }

    /// First indexes of sealed (non-current) segments, oldest first.
    pub fn sealed_segments(&self) -> Vec<u64> {
        let mut firsts: Vec<u64> = self.segments.keys().copied().collect();
        firsts.pop(); // the greatest key is the current segment
        firsts
    }

    /// Range and occupancy of the segment starting at `first_index`.
    pub fn segment_stats(&self, first_index: u64) -> Option<(u64, u64, u64)> {
        self.segments
            .get(&first_index)
            .map(|s| (s.first_index(), s.last_index(), s.len() as u64))
    }

    /// Entries physically present in the segment starting at `first_index`.
    pub fn segment_entries(&mut self, first_index: u64) -> Result<Vec<Entry>> {
        match self.segments.get_mut(&first_index) {
            Some(segment) => segment.entries(),
            None => Err(Error::corruption(format!(
                "no segment starts at index {first_index}"
            ))),
        }
    }

    /// Rewrite one sealed segment, keeping only entries `retain` accepts.
    /// The segment's final entry is always kept so its logical range is
    /// preserved. No-op when nothing would be dropped.
    pub fn rewrite_segment(
        &mut self,
        first_index: u64,
        retain: &dyn Fn(&Entry) -> bool,
    ) -> Result<RewriteStats> {
        if first_index == *self.segments.keys().last().expect("log has a segment") {
            return Err(Error::corruption("cannot rewrite the current segment"));
        }
        let Some(segment) = self.segments.get_mut(&first_index) else {
            return Err(Error::corruption(format!(
                "no segment starts at index {first_index}"
            )));
        };

        let last_index = segment.last_index();
        let entries = segment.entries()?;
        let stats_before = RewriteStats {
            entries_before: entries.len() as u64,
            bytes_before: segment.size(),
            ..Default::default()
        };
        let descriptor = segment.descriptor().clone();

        let retained: Vec<&Entry> = entries
            .iter()
            .filter(|e| e.index == last_index || retain(e))
            .collect();
        if retained.len() == entries.len() {
            return Ok(RewriteStats {
                entries_after: stats_before.entries_before,
                bytes_after: stats_before.bytes_before,
                ..stats_before
            });
        }

        let new_descriptor = SegmentDescriptor {
            version: descriptor.version + 1,
            updated: 0,
            ..descriptor
        };
        let mut replacement = Segment::create(&self.directory, &self.name, new_descriptor)?;
        for entry in &retained {
            replacement.append(entry, &self.pool)?;
        }
        replacement.seal(now_ms())?;

        let stats = RewriteStats {
            entries_after: replacement.len() as u64,
            bytes_after: replacement.size(),
            ..stats_before
        };
        let old = self.segments.remove(&first_index).expect("segment present");
        self.segments.insert(first_index, replacement);
        old.delete()?;
        Ok(stats)
    }

    /// Merge a run of contiguous sealed segments into one, keeping only
    /// entries `retain` accepts plus the final entry of the run.
    pub fn merge_segments(
        &mut self,
        first_indices: &[u64],
        retain: &dyn Fn(&Entry) -> bool,
    ) -> Result<RewriteStats> {
        if first_indices.len() < 2 {
            return Err(Error::corruption("merge requires at least two segments"));
        }
        let current_first = *self.segments.keys().last().expect("log has a segment");
        if first_indices.contains(&current_first) {
            return Err(Error::corruption("cannot merge the current segment"));
        }

        let mut stats = RewriteStats::default();
        let mut entries: Vec<Entry> = Vec::new();
        let mut merged_id = u64::MAX;
        let mut merged_version = 0u64;
        let mut run_last = 0u64;
        let mut expected_next: Option<u64> = None;
        for &first in first_indices {
            let Some(segment) = self.segments.get_mut(&first) else {
                return Err(Error::corruption(format!(
                    "no segment starts at index {first}"
                )));
            };
            if expected_next.is_some_and(|next| first != next) {
                return Err(Error::corruption("merged segments must be contiguous"));
            }
            expected_next = Some(segment.last_index() + 1);
            merged_id = merged_id.min(segment.id());
            merged_version = merged_version.max(segment.version());
            run_last = segment.last_index();
            stats.bytes_before += segment.size();
            let segment_entries = segment.entries()?;
            stats.entries_before += segment_entries.len() as u64;
            entries.extend(segment_entries);
        }

        let descriptor = SegmentDescriptor {
            id: merged_id,
            version: merged_version + 1,
            first_index: first_indices[0],
            updated: 0,
            max_entry_size: self.config.max_entry_size,
            max_segment_size: self.config.max_segment_size,
            max_entries: self.config.max_entries_per_segment,
            locked: true,
        };
        let mut replacement = Segment::create(&self.directory, &self.name, descriptor)?;
        for entry in &entries {
            if entry.index == run_last || retain(entry) {
                replacement.append(entry, &self.pool)?;
            }
        }
        replacement.seal(now_ms())?;
        stats.entries_after = replacement.len() as u64;
        stats.bytes_after = replacement.size();

        for &first in first_indices {
            let old = self.segments.remove(&first).expect("segment present");
            old.delete()?;
        }
        self.segments.insert(first_indices[0], replacement);
        Ok(stats)
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("name", &self.name)
            .field("segments", &self.segments.len())
            .field("first_index", &self.first_index())
            .field("last_index", &self.last_index())
            .field("commit_index", &self.commit_index)
            .finish()
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
