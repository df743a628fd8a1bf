//! Wire Protocol Messages
//!
//! Requests and responses exchanged between servers and clients. Every
//! response carries a [`Status`]; error responses additionally carry a
//! [`RaftError`] code that clients use to decide between retrying, finding a
//! new leader, or re-registering their session.
//!
//! The membership operations (join, leave, promote, demote) share one
//! request/response shape ([`ConfigureRequest`] / [`ConfigureResponse`]) but
//! keep four distinct wire type ids each, so the frame prefix alone names the
//! operation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::codec::{self, *};
use crate::entry::{decode_entries, encode_entries, Entry};
use crate::member::Address;
use crate::{Error as CodecError, Result};

/// Outcome carried on every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    fn code(self) -> u8 {
        match self {
            Status::Ok => 1,
            Status::Error => 0,
        }
    }

    fn from_code(code: u8) -> Status {
        if code == 1 {
            Status::Ok
        } else {
            Status::Error
        }
    }
}

/// Protocol-level error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RaftError {
    #[error("no leader is currently known")]
    NoLeader,
    #[error("request received by a member in an illegal state")]
    IllegalMemberState,
    #[error("command failed to commit")]
    CommandError,
    #[error("the state machine raised an error")]
    ApplicationError,
    #[error("internal server error")]
    InternalError,
    #[error("unknown session")]
    UnknownSession,
}

impl RaftError {
    pub fn code(self) -> u8 {
        match self {
            RaftError::NoLeader => 1,
            RaftError::IllegalMemberState => 2,
            RaftError::CommandError => 3,
            RaftError::ApplicationError => 4,
            RaftError::InternalError => 5,
            RaftError::UnknownSession => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<RaftError> {
        Ok(match code {
            1 => RaftError::NoLeader,
            2 => RaftError::IllegalMemberState,
            3 => RaftError::CommandError,
            4 => RaftError::ApplicationError,
            5 => RaftError::InternalError,
            6 => RaftError::UnknownSession,
            other => return Err(CodecError::invalid(format!("unknown error code {other}"))),
        })
    }

    /// Whether a client should retry the same request (possibly against a
    /// different leader) after seeing this error.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RaftError::NoLeader | RaftError::IllegalMemberState | RaftError::CommandError
        )
    }
}

fn put_error(buf: &mut impl BufMut, error: Option<RaftError>) {
    buf.put_u8(error.map(RaftError::code).unwrap_or(0));
}

fn get_error(buf: &mut impl Buf) -> Result<Option<RaftError>> {
    match codec::get_u8(buf)? {
        0 => Ok(None),
        code => Ok(Some(RaftError::from_code(code)?)),
    }
}

/// Query consistency levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Apply immediately against local state at `lastApplied`.
    Serializable,
    /// Apply locally while the leader's lease holds; otherwise fall through
    /// to a strict quorum round.
    LinearizableLease,
    /// Confirm leadership with a quorum round before applying.
    #[default]
    LinearizableStrict,
}

impl Consistency {
    fn code(self) -> u8 {
        match self {
            Consistency::Serializable => 0,
            Consistency::LinearizableLease => 1,
            Consistency::LinearizableStrict => 2,
        }
    }

    fn from_code(code: u8) -> Result<Consistency> {
        Ok(match code {
            0 => Consistency::Serializable,
            1 => Consistency::LinearizableLease,
            2 => Consistency::LinearizableStrict,
            other => {
                return Err(CodecError::invalid(format!(
                    "unknown consistency level {other}"
                )))
            }
        })
    }
}

/// Membership change operations sharing the configure request shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Join,
    Leave,
    Promote,
    Demote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: u64,
    /// Leader's member id.
    pub leader: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub commit_index: u64,
    pub global_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResponse {
    pub status: Status,
    pub term: u64,
    pub succeeded: bool,
    /// On success: the last index this request confirmed matched. On
    /// failure: the last index at which the receiver's log could still
    /// match the leader's.
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    /// Candidate's member id.
    pub candidate: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub status: Status,
    pub term: u64,
    pub voted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub term: u64,
    pub candidate: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResponse {
    pub status: Status,
    pub term: u64,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub session: u64,
    /// Client-assigned request sequence number, for at-most-once semantics.
    pub request: u64,
    /// Highest request number for which the client has received a response;
    /// lets the server purge its response cache.
    pub response: u64,
    pub command: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: Status,
    pub error: Option<RaftError>,
    pub result: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub session: u64,
    /// The state version the client has observed; queries never read older
    /// state.
    pub version: u64,
    pub consistency: Consistency,
    pub query: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: Status,
    pub error: Option<RaftError>,
    pub version: u64,
    pub result: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub member: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub status: Status,
    pub error: Option<RaftError>,
    pub session: u64,
    pub term: u64,
    pub leader: Option<Address>,
    pub members: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveRequest {
    pub session: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub status: Status,
    pub error: Option<RaftError>,
    pub term: u64,
    pub leader: Option<Address>,
    pub members: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub change: MembershipChange,
    pub member: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureResponse {
    pub status: Status,
    pub error: Option<RaftError>,
    pub term: u64,
    pub leader: Option<Address>,
}

/// All requests a server can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Append(AppendRequest),
    Vote(VoteRequest),
    Poll(PollRequest),
    Command(CommandRequest),
    Query(QueryRequest),
    Register(RegisterRequest),
    KeepAlive(KeepAliveRequest),
    Configure(ConfigureRequest),
}

/// All responses a server can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Append(AppendResponse),
    Vote(VoteResponse),
    Poll(PollResponse),
    Command(CommandResponse),
    Query(QueryResponse),
    Register(RegisterResponse),
    KeepAlive(KeepAliveResponse),
    Configure(ConfigureResponse),
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Request::Append(r) => {
                buf.put_u8(MSG_APPEND_REQUEST);
                buf.put_u64(r.term);
                buf.put_u64(r.leader);
                buf.put_u64(r.prev_log_index);
                buf.put_u64(r.prev_log_term);
                encode_entries(&mut buf, &r.entries);
                buf.put_u64(r.commit_index);
                buf.put_u64(r.global_index);
            }
            Request::Vote(r) => {
                buf.put_u8(MSG_VOTE_REQUEST);
                buf.put_u64(r.term);
                buf.put_u64(r.candidate);
                buf.put_u64(r.last_log_index);
                buf.put_u64(r.last_log_term);
            }
            Request::Poll(r) => {
                buf.put_u8(MSG_POLL_REQUEST);
                buf.put_u64(r.term);
                buf.put_u64(r.candidate);
                buf.put_u64(r.last_log_index);
                buf.put_u64(r.last_log_term);
            }
            Request::Command(r) => {
                buf.put_u8(MSG_COMMAND_REQUEST);
                buf.put_u64(r.session);
                buf.put_u64(r.request);
                buf.put_u64(r.response);
                put_bytes(&mut buf, &r.command);
            }
            Request::Query(r) => {
                buf.put_u8(MSG_QUERY_REQUEST);
                buf.put_u64(r.session);
                buf.put_u64(r.version);
                buf.put_u8(r.consistency.code());
                put_bytes(&mut buf, &r.query);
            }
            Request::Register(r) => {
                buf.put_u8(MSG_REGISTER_REQUEST);
                put_address(&mut buf, &r.member);
            }
            Request::KeepAlive(r) => {
                buf.put_u8(MSG_KEEP_ALIVE_REQUEST);
                buf.put_u64(r.session);
            }
            Request::Configure(r) => {
                buf.put_u8(match r.change {
                    MembershipChange::Join => MSG_JOIN_REQUEST,
                    MembershipChange::Leave => MSG_LEAVE_REQUEST,
                    MembershipChange::Promote => MSG_PROMOTE_REQUEST,
                    MembershipChange::Demote => MSG_DEMOTE_REQUEST,
                });
                put_address(&mut buf, &r.member);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: impl Buf) -> Result<Request> {
        let type_id = codec::get_u8(&mut buf)?;
        Ok(match type_id {
            MSG_APPEND_REQUEST => Request::Append(AppendRequest {
                term: get_u64(&mut buf)?,
                leader: get_u64(&mut buf)?,
                prev_log_index: get_u64(&mut buf)?,
                prev_log_term: get_u64(&mut buf)?,
                entries: decode_entries(&mut buf)?,
                commit_index: get_u64(&mut buf)?,
                global_index: get_u64(&mut buf)?,
            }),
            MSG_VOTE_REQUEST => Request::Vote(VoteRequest {
                term: get_u64(&mut buf)?,
                candidate: get_u64(&mut buf)?,
                last_log_index: get_u64(&mut buf)?,
                last_log_term: get_u64(&mut buf)?,
            }),
            MSG_POLL_REQUEST => Request::Poll(PollRequest {
                term: get_u64(&mut buf)?,
                candidate: get_u64(&mut buf)?,
                last_log_index: get_u64(&mut buf)?,
                last_log_term: get_u64(&mut buf)?,
            }),
            MSG_COMMAND_REQUEST => Request::Command(CommandRequest {
                session: get_u64(&mut buf)?,
                request: get_u64(&mut buf)?,
                response: get_u64(&mut buf)?,
                command: get_bytes(&mut buf)?,
            }),
            MSG_QUERY_REQUEST => Request::Query(QueryRequest {
                session: get_u64(&mut buf)?,
                version: get_u64(&mut buf)?,
                consistency: Consistency::from_code(codec::get_u8(&mut buf)?)?,
                query: get_bytes(&mut buf)?,
            }),
            MSG_REGISTER_REQUEST => Request::Register(RegisterRequest {
                member: get_address(&mut buf)?,
            }),
            MSG_KEEP_ALIVE_REQUEST => Request::KeepAlive(KeepAliveRequest {
                session: get_u64(&mut buf)?,
            }),
            MSG_JOIN_REQUEST | MSG_LEAVE_REQUEST | MSG_PROMOTE_REQUEST | MSG_DEMOTE_REQUEST => {
                Request::Configure(ConfigureRequest {
                    change: match type_id {
                        MSG_JOIN_REQUEST => MembershipChange::Join,
                        MSG_LEAVE_REQUEST => MembershipChange::Leave,
                        MSG_PROMOTE_REQUEST => MembershipChange::Promote,
                        _ => MembershipChange::Demote,
                    },
                    member: get_address(&mut buf)?,
                })
            }
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Response::Append(r) => {
                buf.put_u8(MSG_APPEND_RESPONSE);
                buf.put_u8(r.status.code());
                buf.put_u64(r.term);
                put_bool(&mut buf, r.succeeded);
                buf.put_u64(r.log_index);
            }
            Response::Vote(r) => {
                buf.put_u8(MSG_VOTE_RESPONSE);
                buf.put_u8(r.status.code());
                buf.put_u64(r.term);
                put_bool(&mut buf, r.voted);
            }
            Response::Poll(r) => {
                buf.put_u8(MSG_POLL_RESPONSE);
                buf.put_u8(r.status.code());
                buf.put_u64(r.term);
                put_bool(&mut buf, r.accepted);
            }
            Response::Command(r) => {
                buf.put_u8(MSG_COMMAND_RESPONSE);
                buf.put_u8(r.status.code());
                put_error(&mut buf, r.error);
                put_bytes(&mut buf, &r.result);
            }
            Response::Query(r) => {
                buf.put_u8(MSG_QUERY_RESPONSE);
                buf.put_u8(r.status.code());
                put_error(&mut buf, r.error);
                buf.put_u64(r.version);
                put_bytes(&mut buf, &r.result);
            }
            Response::Register(r) => {
                buf.put_u8(MSG_REGISTER_RESPONSE);
                buf.put_u8(r.status.code());
                put_error(&mut buf, r.error);
                buf.put_u64(r.session);
                buf.put_u64(r.term);
                put_optional_address(&mut buf, r.leader.as_ref());
                put_addresses(&mut buf, &r.members);
            }
            Response::KeepAlive(r) => {
                buf.put_u8(MSG_KEEP_ALIVE_RESPONSE);
                buf.put_u8(r.status.code());
                put_error(&mut buf, r.error);
                buf.put_u64(r.term);
                put_optional_address(&mut buf, r.leader.as_ref());
                put_addresses(&mut buf, &r.members);
            }
            Response::Configure(r) => {
                // The configure response id does not distinguish the change
                // kind; the client matches it to its outstanding request.
                buf.put_u8(MSG_JOIN_RESPONSE);
                buf.put_u8(r.status.code());
                put_error(&mut buf, r.error);
                buf.put_u64(r.term);
                put_optional_address(&mut buf, r.leader.as_ref());
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: impl Buf) -> Result<Response> {
        let type_id = codec::get_u8(&mut buf)?;
        Ok(match type_id {
            MSG_APPEND_RESPONSE => Response::Append(AppendResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                term: get_u64(&mut buf)?,
                succeeded: get_bool(&mut buf)?,
                log_index: get_u64(&mut buf)?,
            }),
            MSG_VOTE_RESPONSE => Response::Vote(VoteResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                term: get_u64(&mut buf)?,
                voted: get_bool(&mut buf)?,
            }),
            MSG_POLL_RESPONSE => Response::Poll(PollResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                term: get_u64(&mut buf)?,
                accepted: get_bool(&mut buf)?,
            }),
            MSG_COMMAND_RESPONSE => Response::Command(CommandResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                error: get_error(&mut buf)?,
                result: get_bytes(&mut buf)?,
            }),
            MSG_QUERY_RESPONSE => Response::Query(QueryResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                error: get_error(&mut buf)?,
                version: get_u64(&mut buf)?,
                result: get_bytes(&mut buf)?,
            }),
            MSG_REGISTER_RESPONSE => Response::Register(RegisterResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                error: get_error(&mut buf)?,
                session: get_u64(&mut buf)?,
                term: get_u64(&mut buf)?,
                leader: get_optional_address(&mut buf)?,
                members: get_addresses(&mut buf)?,
            }),
            MSG_KEEP_ALIVE_RESPONSE => Response::KeepAlive(KeepAliveResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                error: get_error(&mut buf)?,
                term: get_u64(&mut buf)?,
                leader: get_optional_address(&mut buf)?,
                members: get_addresses(&mut buf)?,
            }),
            MSG_JOIN_RESPONSE | MSG_LEAVE_RESPONSE | MSG_PROMOTE_RESPONSE
            | MSG_DEMOTE_RESPONSE => Response::Configure(ConfigureResponse {
                status: Status::from_code(codec::get_u8(&mut buf)?),
                error: get_error(&mut buf)?,
                term: get_u64(&mut buf)?,
                leader: get_optional_address(&mut buf)?,
            }),
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}
