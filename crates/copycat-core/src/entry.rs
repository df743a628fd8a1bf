//! Replicated Log Entries
//!
//! An [`Entry`] is the unit of replication: an index and term plus a typed
//! [`Payload`]. Entries are immutable once appended; the storage layer hands
//! out decoded copies whose command/query bytes share the read buffer.
//!
//! ## Entry kinds
//! - **NoOp**: appended by a new leader to force commitment of entries from
//!   earlier terms
//! - **Configuration**: the full cluster view (active + passive members)
//! - **Register / KeepAlive**: session lifecycle
//! - **Command / Query**: user operations against the state machine
//! - **Join / Leave / Promote / Demote**: single-member membership changes
//!
//! Session timeouts are evaluated against entry timestamps, never wall-clock,
//! so every replica expires the same sessions at the same log position.

use bytes::{Buf, BufMut, Bytes};

use crate::codec::{self, *};
use crate::member::Address;
use crate::varint;
use crate::{Error, Result};

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// 1-based position in the log.
    pub index: u64,

    /// Election term under which the entry was created.
    pub term: u64,

    /// The typed entry body.
    pub payload: Payload,
}

/// Typed entry bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    NoOp,
    Configuration {
        active: Vec<Address>,
        passive: Vec<Address>,
    },
    Register {
        member: Address,
        timestamp: u64,
    },
    KeepAlive {
        session: u64,
        timestamp: u64,
    },
    Command {
        session: u64,
        request: u64,
        response: u64,
        timestamp: u64,
        command: Bytes,
    },
    Query {
        session: u64,
        version: u64,
        timestamp: u64,
        query: Bytes,
    },
    Join {
        member: Address,
    },
    Leave {
        member: Address,
    },
    Promote {
        member: Address,
    },
    Demote {
        member: Address,
    },
}

impl Entry {
    pub fn new(index: u64, term: u64, payload: Payload) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }

    /// The registry id for this entry's payload kind.
    pub fn type_id(&self) -> u8 {
        match &self.payload {
            Payload::NoOp => ENTRY_NO_OP,
            Payload::Configuration { .. } => ENTRY_CONFIGURATION,
            Payload::Register { .. } => ENTRY_REGISTER,
            Payload::KeepAlive { .. } => ENTRY_KEEP_ALIVE,
            Payload::Command { .. } => ENTRY_COMMAND,
            Payload::Query { .. } => ENTRY_QUERY,
            Payload::Join { .. } => ENTRY_JOIN,
            Payload::Leave { .. } => ENTRY_LEAVE,
            Payload::Promote { .. } => ENTRY_PROMOTE,
            Payload::Demote { .. } => ENTRY_DEMOTE,
        }
    }

    /// Timestamp carried by the payload, if any.
    pub fn timestamp(&self) -> Option<u64> {
        match &self.payload {
            Payload::Register { timestamp, .. }
            | Payload::KeepAlive { timestamp, .. }
            | Payload::Command { timestamp, .. }
            | Payload::Query { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }

    /// Encode the entry body (index, term, payload fields) without the frame.
    pub fn encode_body(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.index);
        buf.put_u64(self.term);
        match &self.payload {
            Payload::NoOp => {}
            Payload::Configuration { active, passive } => {
                put_addresses(buf, active);
                put_addresses(buf, passive);
            }
            Payload::Register { member, timestamp } => {
                put_address(buf, member);
                buf.put_u64(*timestamp);
            }
            Payload::KeepAlive { session, timestamp } => {
                buf.put_u64(*session);
                buf.put_u64(*timestamp);
            }
            Payload::Command {
                session,
                request,
                response,
                timestamp,
                command,
            } => {
                buf.put_u64(*session);
                buf.put_u64(*request);
                buf.put_u64(*response);
                buf.put_u64(*timestamp);
                put_bytes(buf, command);
            }
            Payload::Query {
                session,
                version,
                timestamp,
                query,
            } => {
                buf.put_u64(*session);
                buf.put_u64(*version);
                buf.put_u64(*timestamp);
                put_bytes(buf, query);
            }
            Payload::Join { member }
            | Payload::Leave { member }
            | Payload::Promote { member }
            | Payload::Demote { member } => {
                put_address(buf, member);
            }
        }
    }

    /// Decode an entry body previously produced by [`Entry::encode_body`].
    pub fn decode_body(type_id: u8, buf: &mut impl Buf) -> Result<Entry> {
        let index = get_u64(buf)?;
        let term = get_u64(buf)?;
        let payload = match type_id {
            ENTRY_NO_OP => Payload::NoOp,
            ENTRY_CONFIGURATION => Payload::Configuration {
                active: get_addresses(buf)?,
                passive: get_addresses(buf)?,
            },
            ENTRY_REGISTER => Payload::Register {
                member: get_address(buf)?,
                timestamp: get_u64(buf)?,
            },
            ENTRY_KEEP_ALIVE => Payload::KeepAlive {
                session: get_u64(buf)?,
                timestamp: get_u64(buf)?,
            },
            ENTRY_COMMAND => Payload::Command {
                session: get_u64(buf)?,
                request: get_u64(buf)?,
                response: get_u64(buf)?,
                timestamp: get_u64(buf)?,
                command: get_bytes(buf)?,
            },
            ENTRY_QUERY => Payload::Query {
                session: get_u64(buf)?,
                version: get_u64(buf)?,
                timestamp: get_u64(buf)?,
                query: get_bytes(buf)?,
            },
            ENTRY_JOIN => Payload::Join {
                member: get_address(buf)?,
            },
            ENTRY_LEAVE => Payload::Leave {
                member: get_address(buf)?,
            },
            ENTRY_PROMOTE => Payload::Promote {
                member: get_address(buf)?,
            },
            ENTRY_DEMOTE => Payload::Demote {
                member: get_address(buf)?,
            },
            other => return Err(Error::UnknownType(other)),
        };
        Ok(Entry::new(index, term, payload))
    }

    /// Estimated encoded size of the body, used for replication batching and
    /// segment-full checks.
    pub fn size(&self) -> usize {
        let payload = match &self.payload {
            Payload::NoOp => 0,
            Payload::Configuration { active, passive } => {
                address_list_len(active) + address_list_len(passive)
            }
            Payload::Register { member, .. } => address_len(member) + 8,
            Payload::KeepAlive { .. } => 16,
            Payload::Command { command, .. } => {
                32 + varint::encoded_len(command.len() as u64) + command.len()
            }
            Payload::Query { query, .. } => {
                24 + varint::encoded_len(query.len() as u64) + query.len()
            }
            Payload::Join { member }
            | Payload::Leave { member }
            | Payload::Promote { member }
            | Payload::Demote { member } => address_len(member),
        };
        16 + payload
    }
}

fn address_len(address: &Address) -> usize {
    varint::encoded_len(address.host.len() as u64) + address.host.len() + 2
}

fn address_list_len(addresses: &[Address]) -> usize {
    varint::encoded_len(addresses.len() as u64) + addresses.iter().map(address_len).sum::<usize>()
}

/// Encode entries for the wire: count followed by type-prefixed bodies.
pub fn encode_entries(buf: &mut impl BufMut, entries: &[Entry]) {
    varint::encode_u64(buf, entries.len() as u64);
    for entry in entries {
        buf.put_u8(entry.type_id());
        entry.encode_body(buf);
    }
}

/// Decode entries previously produced by [`encode_entries`].
pub fn decode_entries(buf: &mut impl Buf) -> Result<Vec<Entry>> {
    let count = varint::decode_u64(buf)? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let type_id = codec::get_u8(buf)?;
        entries.push(Entry::decode_body(type_id, buf)?);
    }
    Ok(entries)
}
