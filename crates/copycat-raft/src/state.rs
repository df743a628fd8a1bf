//! Server Context
//!
//! The mutable state one Raft server owns: term and vote bookkeeping, the
//! commit/global/applied indexes, the log, the cluster view, and the session
//! registry. The context lives inside the server's single event-loop task
//! and is never shared across threads; role handlers borrow it mutably and
//! re-check it after every suspension point.

use copycat_storage::Log;

use crate::cluster::Cluster;
use crate::session::SessionManager;

/// The state owned by one server's event loop.
pub struct ServerContext {
    /// Current election term.
    pub term: u64,

    /// Member id of the known leader, if any.
    pub leader: Option<u64>,

    /// Candidate voted for in the current term; 0 when unvoted.
    pub last_voted_for: u64,

    /// Highest index known committed on a quorum.
    pub commit_index: u64,

    /// Minimum match index across peers; the safe upper bound for major
    /// compaction.
    pub global_index: u64,

    /// Highest index applied to the state machine.
    pub last_applied: u64,

    pub log: Log,
    pub cluster: Cluster,
    pub sessions: SessionManager,
}

impl ServerContext {
    pub fn new(log: Log, cluster: Cluster, sessions: SessionManager) -> Self {
        Self {
            term: 0,
            leader: None,
            last_voted_for: 0,
            commit_index: 0,
            global_index: 0,
            last_applied: 0,
            log,
            cluster,
            sessions,
        }
    }

    /// Observe a term. Entering a higher term clears the vote and leader.
    pub fn set_term(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.last_voted_for = 0;
            self.leader = None;
        }
    }

    /// Whether a candidate's log is at least as up-to-date as ours.
    pub fn log_up_to_date(&mut self, last_log_index: u64, last_log_term: u64) -> bool {
        if self.log.is_empty() {
            return true;
        }
        let local_last = self.log.last_index();
        let local_term = self.log.last_term().unwrap_or(0);
        last_log_term > local_term || (last_log_term == local_term && last_log_index >= local_last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copycat_core::{Address, Payload};
    use copycat_storage::StorageConfig;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> ServerContext {
        let log = Log::open(
            "raft",
            StorageConfig::with_directory(dir.path()),
        )
        .unwrap();
        let local = Address::new("localhost", 1);
        let cluster = Cluster::new(local.clone(), vec![local], vec![]);
        ServerContext::new(log, cluster, SessionManager::new(1000))
    }

    #[test]
    fn test_higher_term_clears_vote_and_leader() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        ctx.term = 3;
        ctx.last_voted_for = 42;
        ctx.leader = Some(42);

        ctx.set_term(3);
        assert_eq!(ctx.last_voted_for, 42, "same term keeps the vote");

        ctx.set_term(4);
        assert_eq!(ctx.term, 4);
        assert_eq!(ctx.last_voted_for, 0);
        assert_eq!(ctx.leader, None);
    }

    #[test]
    fn test_lower_term_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        ctx.set_term(5);
        ctx.set_term(2);
        assert_eq!(ctx.term, 5);
    }

    #[test]
    fn test_empty_log_is_always_behind() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        assert!(ctx.log_up_to_date(0, 0));
        assert!(ctx.log_up_to_date(10, 3));
    }

    #[test]
    fn test_up_to_date_rules() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        for term in [1, 1, 2] {
            let entry = ctx.log.create(term, Payload::NoOp);
            ctx.log.append(&entry).unwrap();
        }
        // Local log: indexes 1-3, last term 2.
        assert!(ctx.log_up_to_date(3, 2), "identical log");
        assert!(ctx.log_up_to_date(5, 2), "longer log, same term");
        assert!(ctx.log_up_to_date(1, 3), "higher last term wins");
        assert!(!ctx.log_up_to_date(2, 2), "shorter log, same term");
        assert!(!ctx.log_up_to_date(9, 1), "lower last term loses");
    }
}
