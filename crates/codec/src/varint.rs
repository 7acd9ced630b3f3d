//! LEB128 varints and zigzag mapping

use std::io::{ErrorKind, Read};

use bytes::{Buf, BufMut};

use crate::error::{CodecError, Result};

/// Longest encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

pub fn put_uvarint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn get_uvarint(buf: &mut impl Buf) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(CodecError::invalid("varint overflows u64"));
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Read a varint from a byte stream
///
/// Returns `Ok(None)` on a clean end of stream before the first byte.
pub fn read_uvarint(reader: &mut impl Read) -> Result<Option<u64>> {
    let mut result = 0u64;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];
    loop {
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                if shift == 0 {
                    return Ok(None);
                }
                return Err(CodecError::Truncated {
                    needed: 1,
                    remaining: 0,
                });
            }
            Err(e) => return Err(e.into()),
        }
        if shift == 63 && byte[0] > 1 {
            return Err(CodecError::invalid("varint overflows u64"));
        }
        result |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(result));
        }
        shift += 7;
    }
}

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
