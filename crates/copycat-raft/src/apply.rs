//! State-Machine Executor
//!
//! Applies committed entries to the user state machine in strict index
//! order, exactly once per index. Session bookkeeping (registration,
//! keep-alives, expiry, duplicate replay) happens here so that the user
//! state machine only ever sees each command once.
//!
//! Before any timestamped entry is processed, sessions whose last keep-alive
//! predates the session timeout (relative to that entry's timestamp) are
//! expired. Timeouts are never measured against wall clock: replay of the
//! same log always produces the same expirations.

use bytes::Bytes;
use copycat_core::{Entry, Payload, RaftError};
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::session::{CommandOutcome, SessionManager};

/// A committed command presented to the user state machine.
#[derive(Debug)]
pub struct Commit<'a> {
    /// Log index of the command entry.
    pub index: u64,
    /// The submitting session.
    pub session: u64,
    /// Leader-assigned timestamp (ms). Use this for TTLs, never wall clock.
    pub timestamp: u64,
    /// The opaque command payload.
    pub command: &'a [u8],
}

/// A query presented to the user state machine. Queries must not mutate
/// state.
#[derive(Debug)]
pub struct Query<'a> {
    /// The state version (last applied index) the query executes against.
    pub version: u64,
    /// Timestamp of the most recently applied timestamped entry.
    pub timestamp: u64,
    /// The opaque query payload.
    pub query: &'a [u8],
}

/// The replicated state machine supplied by the user.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command. Errors are surfaced to the submitting
    /// client as application errors; they do not destabilize the cluster.
    fn apply(&mut self, commit: Commit<'_>) -> std::result::Result<Bytes, String>;

    /// Answer a read-only query against current state.
    fn query(&self, query: Query<'_>) -> std::result::Result<Bytes, String>;

    /// Whether the command entry at `index` still contributes to current
    /// state. Entries reported dispensable may be dropped by compaction.
    fn retain(&self, index: u64, command: &[u8]) -> bool {
        let _ = (index, command);
        true
    }
}

/// The result of applying one entry.
#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing to report (no-op, query placeholder).
    None,
    /// A session was registered with this id.
    SessionRegistered(u64),
    /// A keep-alive was processed.
    KeepAlive(std::result::Result<(), RaftError>),
    /// A command was applied (or replayed from the session cache).
    Command(std::result::Result<Bytes, RaftError>),
    /// The cluster configuration changed.
    Configuration,
}

/// Applies committed entries to the user state machine.
pub struct Executor {
    state_machine: Box<dyn StateMachine>,
    /// Timestamp of the most recently applied timestamped entry.
    timestamp: u64,
}

impl Executor {
    pub fn new(state_machine: Box<dyn StateMachine>) -> Self {
        Self {
            state_machine,
            timestamp: 0,
        }
    }

    /// The logical clock: the highest applied entry timestamp.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Apply one committed entry. Callers guarantee strict index order.
    pub fn apply(
        &mut self,
        entry: &Entry,
        sessions: &mut SessionManager,
        cluster: &mut Cluster,
    ) -> ApplyOutcome {
        if let Some(timestamp) = entry.timestamp() {
            self.timestamp = self.timestamp.max(timestamp);
            sessions.expire(self.timestamp);
        }

        match &entry.payload {
            Payload::NoOp => ApplyOutcome::None,
            Payload::Register { member, timestamp } => {
                sessions.register(entry.index, member.clone(), *timestamp);
                ApplyOutcome::SessionRegistered(entry.index)
            }
            Payload::KeepAlive { session, timestamp } => {
                if sessions.keep_alive(*session, *timestamp) {
                    ApplyOutcome::KeepAlive(Ok(()))
                } else {
                    ApplyOutcome::KeepAlive(Err(RaftError::UnknownSession))
                }
            }
            Payload::Command {
                session,
                request,
                response,
                timestamp,
                command,
            } => ApplyOutcome::Command(self.apply_command(
                entry.index,
                *session,
                *request,
                *response,
                *timestamp,
                command,
                sessions,
            )),
            Payload::Query { .. } => {
                // Query entries order reads; they never mutate state.
                ApplyOutcome::None
            }
            Payload::Configuration { active, passive } => {
                cluster.set_view(entry.index, active.clone(), passive.clone());
                ApplyOutcome::Configuration
            }
            Payload::Join { member } => {
                cluster.join(entry.index, member.clone());
                ApplyOutcome::Configuration
            }
            Payload::Leave { member } => {
                cluster.leave(entry.index, member);
                ApplyOutcome::Configuration
            }
            Payload::Promote { member } => {
                cluster.promote(entry.index, member);
                ApplyOutcome::Configuration
            }
            Payload::Demote { member } => {
                cluster.demote(entry.index, member);
                ApplyOutcome::Configuration
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_command(
        &mut self,
        index: u64,
        session_id: u64,
        request: u64,
        acknowledged: u64,
        timestamp: u64,
        command: &Bytes,
        sessions: &mut SessionManager,
    ) -> std::result::Result<Bytes, RaftError> {
        // Session 0 is the sessionless path: the command applies without
        // replay tracking, so duplicates are the submitter's problem.
        if session_id == 0 {
            return self
                .state_machine
                .apply(Commit {
                    index,
                    session: 0,
                    timestamp,
                    command,
                })
                .map_err(|message| {
                    warn!(%message, "sessionless command failed");
                    RaftError::ApplicationError
                });
        }

        let Some(session) = sessions.get(session_id) else {
            return Err(RaftError::UnknownSession);
        };

        // Duplicate: replay the cached outcome without re-applying.
        if request <= session.sequence {
            debug!(session = session_id, request, "replaying cached response");
            return match session.cached(request) {
                Some(CommandOutcome::Success(bytes)) => Ok(bytes.clone()),
                Some(CommandOutcome::Failure) => Err(RaftError::ApplicationError),
                None => Ok(Bytes::new()),
            };
        }

        let result = self.state_machine.apply(Commit {
            index,
            session: session_id,
            timestamp,
            command,
        });

        let session = sessions
            .get_mut(session_id)
            .expect("session present moments ago");
        match result {
            Ok(bytes) => {
                session.record(request, CommandOutcome::Success(bytes.clone()), acknowledged);
                Ok(bytes)
            }
            Err(message) => {
                warn!(session = session_id, request, %message, "command failed");
                session.record(request, CommandOutcome::Failure, acknowledged);
                Err(RaftError::ApplicationError)
            }
        }
    }

    /// Answer a read-only query at the given applied version.
    pub fn query(&self, version: u64, query: &[u8]) -> std::result::Result<Bytes, RaftError> {
        self.state_machine
            .query(Query {
                version,
                timestamp: self.timestamp,
                query,
            })
            .map_err(|message| {
                warn!(%message, "query failed");
                RaftError::ApplicationError
            })
    }

    /// Whether a command entry still contributes to current state.
    pub fn retain_command(&self, index: u64, command: &[u8]) -> bool {
        self.state_machine.retain(index, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copycat_core::Address;
    use std::collections::HashMap;

    /// A counter state machine that records how many times apply ran, for
    /// asserting at-most-once semantics.
    struct Counter {
        value: u64,
        applies: u64,
    }

    impl StateMachine for Counter {
        fn apply(&mut self, commit: Commit<'_>) -> std::result::Result<Bytes, String> {
            if commit.command == b"fail" {
                return Err("boom".into());
            }
            self.value += 1;
            self.applies += 1;
            Ok(Bytes::from(self.value.to_string()))
        }

        fn query(&self, _query: Query<'_>) -> std::result::Result<Bytes, String> {
            Ok(Bytes::from(self.value.to_string()))
        }
    }

    fn fixture() -> (Executor, SessionManager, Cluster) {
        let executor = Executor::new(Box::new(Counter {
            value: 0,
            applies: 0,
        }));
        let sessions = SessionManager::new(1000);
        let cluster = Cluster::new(
            Address::new("localhost", 1),
            vec![Address::new("localhost", 1)],
            vec![],
        );
        (executor, sessions, cluster)
    }

    fn register(index: u64, timestamp: u64) -> Entry {
        Entry::new(
            index,
            1,
            Payload::Register {
                member: Address::new("client", 0),
                timestamp,
            },
        )
    }

    fn command(index: u64, session: u64, request: u64, timestamp: u64, body: &str) -> Entry {
        Entry::new(
            index,
            1,
            Payload::Command {
                session,
                request,
                response: 0,
                timestamp,
                command: Bytes::from(body.to_string()),
            },
        )
    }

    #[test]
    fn test_register_creates_session() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        let outcome = executor.apply(&register(1, 100), &mut sessions, &mut cluster);
        assert_eq!(outcome, ApplyOutcome::SessionRegistered(1));
        assert!(sessions.contains(1));
    }

    #[test]
    fn test_command_applies_once() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        executor.apply(&register(1, 100), &mut sessions, &mut cluster);

        let outcome = executor.apply(&command(2, 1, 1, 110, "inc"), &mut sessions, &mut cluster);
        assert_eq!(outcome, ApplyOutcome::Command(Ok(Bytes::from("1"))));

        // Same session, same request id: replayed, not re-applied.
        let outcome = executor.apply(&command(3, 1, 1, 120, "inc"), &mut sessions, &mut cluster);
        assert_eq!(outcome, ApplyOutcome::Command(Ok(Bytes::from("1"))));
    }

    #[test]
    fn test_sessionless_command_applies_without_tracking() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        let outcome = executor.apply(&command(1, 0, 1, 100, "inc"), &mut sessions, &mut cluster);
        assert_eq!(outcome, ApplyOutcome::Command(Ok(Bytes::from("1"))));
        // No session means no replay cache: the duplicate applies again.
        let outcome = executor.apply(&command(2, 0, 1, 110, "inc"), &mut sessions, &mut cluster);
        assert_eq!(outcome, ApplyOutcome::Command(Ok(Bytes::from("2"))));
    }

    #[test]
    fn test_unknown_session_command() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        let outcome = executor.apply(&command(1, 9, 1, 100, "inc"), &mut sessions, &mut cluster);
        assert_eq!(
            outcome,
            ApplyOutcome::Command(Err(RaftError::UnknownSession))
        );
    }

    #[test]
    fn test_failed_command_replays_failure() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        executor.apply(&register(1, 100), &mut sessions, &mut cluster);

        let outcome = executor.apply(&command(2, 1, 1, 110, "fail"), &mut sessions, &mut cluster);
        assert_eq!(
            outcome,
            ApplyOutcome::Command(Err(RaftError::ApplicationError))
        );
        let outcome = executor.apply(&command(3, 1, 1, 120, "fail"), &mut sessions, &mut cluster);
        assert_eq!(
            outcome,
            ApplyOutcome::Command(Err(RaftError::ApplicationError))
        );
    }

    #[test]
    fn test_keep_alive_outcomes() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        executor.apply(&register(1, 100), &mut sessions, &mut cluster);

        let alive = Entry::new(
            2,
            1,
            Payload::KeepAlive {
                session: 1,
                timestamp: 300,
            },
        );
        assert_eq!(
            executor.apply(&alive, &mut sessions, &mut cluster),
            ApplyOutcome::KeepAlive(Ok(()))
        );

        let unknown = Entry::new(
            3,
            1,
            Payload::KeepAlive {
                session: 77,
                timestamp: 300,
            },
        );
        assert_eq!(
            executor.apply(&unknown, &mut sessions, &mut cluster),
            ApplyOutcome::KeepAlive(Err(RaftError::UnknownSession))
        );
    }

    #[test]
    fn test_sessions_expire_at_apply_time() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        executor.apply(&register(1, 100), &mut sessions, &mut cluster);

        // An entry timestamped far past the session timeout expires it
        // before the entry itself is processed.
        let outcome = executor.apply(&command(2, 1, 1, 5000, "inc"), &mut sessions, &mut cluster);
        assert_eq!(
            outcome,
            ApplyOutcome::Command(Err(RaftError::UnknownSession))
        );
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_logical_clock_is_monotonic() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        executor.apply(&register(1, 500), &mut sessions, &mut cluster);
        executor.apply(&command(2, 1, 1, 400, "inc"), &mut sessions, &mut cluster);
        assert_eq!(executor.timestamp(), 500);
    }

    #[test]
    fn test_membership_entries_mutate_cluster() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        let joiner = Address::new("localhost", 4);

        let join = Entry::new(1, 1, Payload::Join { member: joiner.clone() });
        assert_eq!(
            executor.apply(&join, &mut sessions, &mut cluster),
            ApplyOutcome::Configuration
        );
        assert!(cluster.is_passive(joiner.id()));

        let promote = Entry::new(2, 1, Payload::Promote { member: joiner.clone() });
        executor.apply(&promote, &mut sessions, &mut cluster);
        assert!(cluster.is_active(joiner.id()));
        assert_eq!(cluster.config_index(), 2);
    }

    #[test]
    fn test_query_delegates_to_state_machine() {
        let (mut executor, mut sessions, mut cluster) = fixture();
        executor.apply(&register(1, 100), &mut sessions, &mut cluster);
        executor.apply(&command(2, 1, 1, 110, "inc"), &mut sessions, &mut cluster);
        assert_eq!(executor.query(2, b"value").unwrap(), Bytes::from("1"));
    }

    /// A map state machine exercising the retain hook.
    struct LastWrite {
        live: HashMap<Vec<u8>, u64>,
    }

    impl StateMachine for LastWrite {
        fn apply(&mut self, commit: Commit<'_>) -> std::result::Result<Bytes, String> {
            self.live.insert(commit.command.to_vec(), commit.index);
            Ok(Bytes::new())
        }

        fn query(&self, _query: Query<'_>) -> std::result::Result<Bytes, String> {
            Ok(Bytes::new())
        }

        fn retain(&self, index: u64, command: &[u8]) -> bool {
            self.live.get(command) == Some(&index)
        }
    }

    #[test]
    fn test_retain_reports_superseded_commands() {
        let (mut sessions, mut cluster) = {
            let (_, s, c) = fixture();
            (s, c)
        };
        let mut executor = Executor::new(Box::new(LastWrite {
            live: HashMap::new(),
        }));
        executor.apply(&register(1, 100), &mut sessions, &mut cluster);
        executor.apply(&command(2, 1, 1, 110, "k"), &mut sessions, &mut cluster);
        executor.apply(&command(3, 1, 2, 120, "k"), &mut sessions, &mut cluster);

        assert!(!executor.retain_command(2, b"k"), "overwritten write");
        assert!(executor.retain_command(3, b"k"), "latest write");
    }
}
