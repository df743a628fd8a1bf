//! Log Compaction
//!
//! Reclaims space from sealed segments by dropping entries the state machine
//! has flagged cleanable (superseded commands, applied keep-alives, expired
//! sessions). Two policies run over the same rewrite mechanism:
//!
//! - **Minor** compaction rewrites individual sealed segments in place
//!   (unordered: each segment is independent). A segment is rewritten when
//!   its cleanable ratio reaches the configured threshold.
//! - **Major** compaction merges runs of contiguous sealed segments into one,
//!   and is restricted to entries below the global index so no in-flight
//!   replication can still need the dropped bytes.
//!
//! Both policies stop at the commit boundary: uncommitted entries are never
//! touched, and the current segment is never compacted.
//!
//! Every rewrite bumps the segment's version. The swap is crash-safe: the new
//! file is complete and synced before the old one is deleted, and recovery
//! keeps the higher version if both survive.

use copycat_core::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::log::Log;

/// Predicate supplied by the state machine: `true` when the entry may be
/// dropped from the log.
pub type Cleanable<'a> = &'a dyn Fn(&Entry) -> bool;

/// Configuration for the compaction policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Minimum ratio of cleanable entries (0.0 to 1.0) before a segment is
    /// rewritten by minor compaction.
    pub min_clean_ratio: f64,

    /// Maximum number of segments merged in one major compaction run.
    pub max_merge_segments: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_clean_ratio: 0.5,
            max_merge_segments: 8,
        }
    }
}

/// Aggregate result of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub segments_inspected: usize,
    pub segments_rewritten: usize,
    pub entries_dropped: u64,
    pub bytes_reclaimed: u64,
}

/// Runs minor and major compaction passes over a log.
#[derive(Debug, Default)]
pub struct Compactor {
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Minor compaction: rewrite sealed, fully committed segments whose
    /// cleanable ratio reaches the threshold.
    pub fn minor(&self, log: &mut Log, cleanable: Cleanable<'_>) -> Result<CompactionStats> {
        let commit_index = log.commit_index();
        let mut stats = CompactionStats::default();

        for first in log.sealed_segments() {
            let Some((_, last_index, entry_count)) = log.segment_stats(first) else {
                continue;
            };
            if last_index > commit_index || entry_count == 0 {
                continue;
            }
            stats.segments_inspected += 1;

            let entries = log.segment_entries(first)?;
            let cleanable_count = entries
                .iter()
                .filter(|e| e.index != last_index && cleanable(e))
                .count();
            let ratio = cleanable_count as f64 / entries.len() as f64;
            if ratio < self.config.min_clean_ratio {
                debug!(
                    segment = first,
                    ratio, "segment below clean ratio, skipping"
                );
                continue;
            }

            let rewrite = log.rewrite_segment(first, &|e| !cleanable(e))?;
            stats.segments_rewritten += 1;
            stats.entries_dropped += rewrite.entries_before - rewrite.entries_after;
            stats.bytes_reclaimed += rewrite.bytes_before.saturating_sub(rewrite.bytes_after);
        }

        if stats.segments_rewritten > 0 {
            info!(
                segments = stats.segments_rewritten,
                entries_dropped = stats.entries_dropped,
                bytes_reclaimed = stats.bytes_reclaimed,
                "minor compaction complete"
            );
        }
        Ok(stats)
    }

    /// Major compaction: merge runs of contiguous sealed segments whose
    /// entries all sit below both the commit boundary and `global_index`.
    pub fn major(
        &self,
        log: &mut Log,
        global_index: u64,
        cleanable: Cleanable<'_>,
    ) -> Result<CompactionStats> {
        let bound = global_index.min(log.commit_index());
        let mut stats = CompactionStats::default();

        // Build runs of adjacent sealed segments fully below the bound.
        let mut runs: Vec<Vec<u64>> = Vec::new();
        let mut run: Vec<u64> = Vec::new();
        let mut run_end = 0u64;
        for first in log.sealed_segments() {
            let Some((_, last_index, _)) = log.segment_stats(first) else {
                continue;
            };
            if last_index > bound {
                break;
            }
            stats.segments_inspected += 1;
            let adjacent = run.is_empty() || first == run_end + 1;
            if !adjacent || run.len() >= self.config.max_merge_segments {
                if run.len() >= 2 {
                    runs.push(std::mem::take(&mut run));
                } else {
                    run.clear();
                }
            }
            run.push(first);
            run_end = last_index;
        }
        if run.len() >= 2 {
            runs.push(run);
        }

        for run in runs {
            let merge = log.merge_segments(&run, &|e| !cleanable(e))?;
            stats.segments_rewritten += run.len();
            stats.entries_dropped += merge.entries_before - merge.entries_after;
            stats.bytes_reclaimed += merge.bytes_before.saturating_sub(merge.bytes_after);
        }

        if stats.segments_rewritten > 0 {
            info!(
                segments = stats.segments_rewritten,
                entries_dropped = stats.entries_dropped,
                bytes_reclaimed = stats.bytes_reclaimed,
                "major compaction complete"
            );
        }
        Ok(stats)
    }
}
