//! Variable-length Integer Encoding
//!
//! Length prefixes inside entry bodies use varints so small payloads (the
//! common case for commands and queries) cost one byte instead of four.
//! Each byte carries 7 bits of the value plus a continuation flag.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

/// Encode an unsigned integer as a varint.
pub fn encode_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint into an unsigned integer.
pub fn decode_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(Error::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift >= 64 {
            return Err(Error::invalid("varint exceeds 64 bits"));
        }
    }
}

/// The encoded length of `value` in bytes (1 to 10).
pub fn encoded_len(value: u64) -> usize {
    match value {
        0 => 1,
        v => (64 - v.leading_zeros() as usize).div_ceil(7),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(value: u64) -> usize {
        let mut buf = BytesMut::new();
        encode_u64(&mut buf, value);
        let len = buf.len();
        let mut cursor = buf.as_ref();
        assert_eq!(decode_u64(&mut cursor).unwrap(), value);
        assert!(cursor.is_empty());
        len
    }

    #[test]
    fn test_zero() {
        assert_eq!(roundtrip(0), 1);
    }

    #[test]
    fn test_one_byte_boundary() {
        assert_eq!(roundtrip(127), 1);
        assert_eq!(roundtrip(128), 2);
    }

    #[test]
    fn test_large_values() {
        roundtrip(1_000_000);
        roundtrip(u64::MAX);
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        for value in [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_u64(&mut buf, value);
            assert_eq!(buf.len(), encoded_len(value), "value {value}");
        }
    }

    #[test]
    fn test_decode_empty_is_truncated() {
        let mut empty: &[u8] = &[];
        assert!(decode_u64(&mut empty).is_err());
    }

    #[test]
    fn test_decode_unterminated_is_truncated() {
        let mut bad: &[u8] = &[0x80, 0x80];
        assert!(decode_u64(&mut bad).is_err());
    }

    #[test]
    fn test_decode_overlong_rejected() {
        let mut bad: &[u8] = &[0x80; 11];
        assert!(decode_u64(&mut bad).is_err());
    }
}
