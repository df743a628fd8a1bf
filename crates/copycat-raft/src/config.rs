//! Server Configuration

use std::time::Duration;

use copycat_core::Address;
use copycat_storage::StorageConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for one Raft server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// This server's own address.
    pub address: Address,

    /// The bootstrap voting members. A server whose address is not listed
    /// here starts passive and asks the leader to join.
    pub members: Vec<Address>,

    /// Bootstrap non-voting members, if any.
    pub passive: Vec<Address>,

    /// Base election timeout; actual timeouts are randomized in
    /// `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: Duration,

    /// Leader heartbeat period. Must be at most half the election timeout
    /// or followers will start spurious elections.
    pub heartbeat_interval: Duration,

    /// Sessions expire when no keep-alive lands within this window,
    /// measured in applied-entry timestamps.
    pub session_timeout: Duration,

    /// How often the server runs a compaction pass over sealed segments.
    pub compaction_interval: Duration,

    /// Segmented log settings.
    pub storage: StorageConfig,
}

impl ServerConfig {
    pub fn new(address: Address, members: Vec<Address>) -> Self {
        let heartbeat_interval = Duration::from_millis(250);
        Self {
            address,
            members,
            passive: Vec::new(),
            election_timeout: Duration::from_millis(500),
            heartbeat_interval,
            session_timeout: heartbeat_interval * 5,
            compaction_interval: Duration::from_secs(60),
            storage: StorageConfig::default(),
        }
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Scale all timing knobs, keeping their ratios. Tests use this to run
    /// clusters at millisecond speeds.
    pub fn with_timing(mut self, election_timeout: Duration) -> Self {
        self.election_timeout = election_timeout;
        self.heartbeat_interval = election_timeout / 4;
        self.session_timeout = self.heartbeat_interval * 5;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::config("at least one voting member is required"));
        }
        if self.heartbeat_interval.is_zero() || self.election_timeout.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.heartbeat_interval * 2 > self.election_timeout {
            return Err(Error::config(
                "heartbeat interval must be at most half the election timeout",
            ));
        }
        if self.session_timeout < self.heartbeat_interval {
            return Err(Error::config(
                "session timeout must cover at least one keep-alive interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig::new(
            Address::new("localhost", 5001),
            vec![Address::new("localhost", 5001)],
        )
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_default_ratios() {
        let config = base();
        assert_eq!(config.election_timeout, Duration::from_millis(500));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.session_timeout, config.heartbeat_interval * 5);
    }

    #[test]
    fn test_rejects_slow_heartbeat() {
        let mut config = base();
        config.heartbeat_interval = config.election_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_members() {
        let mut config = base();
        config.members.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_timing_keeps_ratios() {
        let config = base().with_timing(Duration::from_millis(200));
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = base();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.address, config.address);
        assert_eq!(decoded.election_timeout, config.election_timeout);
    }
}
