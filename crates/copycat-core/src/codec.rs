//! Deterministic Binary Codec
//!
//! Shared primitives for encoding entries and wire messages. All multi-byte
//! integers are big-endian; variable-length fields carry a varint length
//! prefix. Decoding is checked: every read validates the remaining length
//! first, so a truncated or corrupt frame surfaces as an error instead of a
//! panic.
//!
//! ## Type Registry
//!
//! Every entry and message kind has a stable one-byte type id. Entry ids
//! occupy `0x01..=0x0A` and are written to disk inside segment frames;
//! message ids occupy `0x11..=0x26` and prefix every wire frame. Ids are
//! append-only: retired ids must never be reassigned.

use bytes::{Buf, BufMut, Bytes};

use crate::member::Address;
use crate::varint;
use crate::{Error, Result};

// Entry type ids (on-disk contract).
pub const ENTRY_NO_OP: u8 = 0x01;
pub const ENTRY_CONFIGURATION: u8 = 0x02;
pub const ENTRY_REGISTER: u8 = 0x03;
pub const ENTRY_KEEP_ALIVE: u8 = 0x04;
pub const ENTRY_COMMAND: u8 = 0x05;
pub const ENTRY_QUERY: u8 = 0x06;
pub const ENTRY_JOIN: u8 = 0x07;
pub const ENTRY_LEAVE: u8 = 0x08;
pub const ENTRY_PROMOTE: u8 = 0x09;
pub const ENTRY_DEMOTE: u8 = 0x0A;

// Message type ids (wire contract).
pub const MSG_APPEND_REQUEST: u8 = 0x11;
pub const MSG_APPEND_RESPONSE: u8 = 0x12;
pub const MSG_VOTE_REQUEST: u8 = 0x13;
pub const MSG_VOTE_RESPONSE: u8 = 0x14;
pub const MSG_POLL_REQUEST: u8 = 0x15;
pub const MSG_POLL_RESPONSE: u8 = 0x16;
pub const MSG_COMMAND_REQUEST: u8 = 0x17;
pub const MSG_COMMAND_RESPONSE: u8 = 0x18;
pub const MSG_QUERY_REQUEST: u8 = 0x19;
pub const MSG_QUERY_RESPONSE: u8 = 0x1A;
pub const MSG_REGISTER_REQUEST: u8 = 0x1B;
pub const MSG_REGISTER_RESPONSE: u8 = 0x1C;
pub const MSG_KEEP_ALIVE_REQUEST: u8 = 0x1D;
pub const MSG_KEEP_ALIVE_RESPONSE: u8 = 0x1E;
pub const MSG_JOIN_REQUEST: u8 = 0x1F;
pub const MSG_JOIN_RESPONSE: u8 = 0x20;
pub const MSG_LEAVE_REQUEST: u8 = 0x21;
pub const MSG_LEAVE_RESPONSE: u8 = 0x22;
pub const MSG_PROMOTE_REQUEST: u8 = 0x23;
pub const MSG_PROMOTE_RESPONSE: u8 = 0x24;
pub const MSG_DEMOTE_REQUEST: u8 = 0x25;
pub const MSG_DEMOTE_RESPONSE: u8 = 0x26;

fn ensure(buf: &impl Buf, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn get_bool(buf: &mut impl Buf) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Varint length prefix followed by the raw bytes.
pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    varint::encode_u64(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn get_bytes(buf: &mut impl Buf) -> Result<Bytes> {
    let len = varint::decode_u64(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn get_string(buf: &mut impl Buf) -> Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::invalid("string is not valid utf-8"))
}

pub fn put_address(buf: &mut impl BufMut, address: &Address) {
    put_string(buf, &address.host);
    buf.put_u16(address.port);
}

pub fn get_address(buf: &mut impl Buf) -> Result<Address> {
    let host = get_string(buf)?;
    let port = get_u16(buf)?;
    Ok(Address::new(host, port))
}

pub fn put_addresses(buf: &mut impl BufMut, addresses: &[Address]) {
    varint::encode_u64(buf, addresses.len() as u64);
    for address in addresses {
        put_address(buf, address);
    }
}

pub fn get_addresses(buf: &mut impl Buf) -> Result<Vec<Address>> {
    let count = varint::decode_u64(buf)? as usize;
    let mut addresses = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        addresses.push(get_address(buf)?);
    }
    Ok(addresses)
}

pub fn put_optional_address(buf: &mut impl BufMut, address: Option<&Address>) {
    match address {
        Some(address) => {
            buf.put_u8(1);
            put_address(buf, address);
        }
        None => buf.put_u8(0),
    }
}

pub fn get_optional_address(buf: &mut impl Buf) -> Result<Option<Address>> {
    if get_bool(buf)? {
        Ok(Some(get_address(buf)?))
    } else {
        Ok(None)
    }
}
