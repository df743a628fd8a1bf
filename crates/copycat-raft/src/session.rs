//! Client Sessions
//!
//! A session is created by a committed RegisterEntry (its id is that entry's
//! index) and kept alive by KeepAliveEntries. Sessions carry the state for
//! at-most-once command application: the highest applied request sequence
//! number and a cache of responses for replaying duplicates.
//!
//! ## Determinism
//!
//! Expiry is computed from applied-entry timestamps, never from wall-clock
//! reads, so every replica expires the same sessions at the same log
//! position.

use std::collections::BTreeMap;

use bytes::Bytes;
use copycat_core::Address;
use tracing::debug;

/// The cached outcome of an applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success(Bytes),
    Failure,
}

/// One registered client session.
#[derive(Debug)]
pub struct Session {
    /// Session id: the index of the RegisterEntry that created it.
    pub id: u64,

    /// The client endpoint that registered.
    pub member: Address,

    /// Timestamp of the last keep-alive (or registration).
    pub timestamp: u64,

    /// Highest request sequence number applied for this session.
    pub sequence: u64,

    /// Cached outcomes keyed by request number, for duplicate replay.
    responses: BTreeMap<u64, CommandOutcome>,
}

impl Session {
    fn new(id: u64, member: Address, timestamp: u64) -> Self {
        Self {
            id,
            member,
            timestamp,
            sequence: 0,
            responses: BTreeMap::new(),
        }
    }

    /// The cached outcome for a duplicate request, if still held.
    pub fn cached(&self, request: u64) -> Option<&CommandOutcome> {
        self.responses.get(&request)
    }

    /// Record an applied request: cache the outcome, advance the sequence,
    /// and purge outcomes the client has acknowledged receiving.
    pub fn record(&mut self, request: u64, outcome: CommandOutcome, acknowledged: u64) {
        self.responses.insert(request, outcome);
        self.sequence = self.sequence.max(request);
        self.responses = self.responses.split_off(&(acknowledged + 1));
    }

    #[cfg(test)]
    fn cached_count(&self) -> usize {
        self.responses.len()
    }
}

/// The session registry, owned by the state-machine executor.
#[derive(Debug)]
pub struct SessionManager {
    sessions: BTreeMap<u64, Session>,
    timeout_ms: u64,
}

impl SessionManager {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            sessions: BTreeMap::new(),
            timeout_ms,
        }
    }

    /// Create a session for the RegisterEntry at `id`.
    pub fn register(&mut self, id: u64, member: Address, timestamp: u64) {
        debug!(session = id, member = %member, "session registered");
        self.sessions.insert(id, Session::new(id, member, timestamp));
    }

    /// Refresh a session's timestamp. Returns false for unknown sessions.
    pub fn keep_alive(&mut self, id: u64, timestamp: u64) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.timestamp = session.timestamp.max(timestamp);
                true
            }
            None => false,
        }
    }

    /// Expire sessions whose last keep-alive is older than the session
    /// timeout relative to `timestamp`. Returns the expired ids.
    pub fn expire(&mut self, timestamp: u64) -> Vec<u64> {
        let deadline = timestamp.saturating_sub(self.timeout_ms);
        let expired: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| s.timestamp < deadline)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            debug!(session = id, "session expired");
            self.sessions.remove(id);
        }
        expired
    }

    pub fn get(&self, id: u64) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
