//! Storage Configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the segmented log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the segment files.
    pub directory: PathBuf,

    /// Maximum encoded size of a single entry in bytes.
    pub max_entry_size: u32,

    /// Segment rollover threshold in bytes.
    pub max_segment_size: u32,

    /// Segment rollover threshold in entries.
    pub max_entries_per_segment: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            max_entry_size: 1024 * 1024,        // 1 MiB
            max_segment_size: 32 * 1024 * 1024, // 32 MiB
            max_entries_per_segment: 1024 * 1024,
        }
    }
}

impl StorageConfig {
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.max_entry_size, 1024 * 1024);
        assert_eq!(config.max_segment_size, 32 * 1024 * 1024);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = StorageConfig::with_directory("/tmp/copycat");
        let json = serde_json::to_string(&config).unwrap();
        let decoded: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.directory, PathBuf::from("/tmp/copycat"));
    }
}
