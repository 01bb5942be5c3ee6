//! Variable length unsigned integers
//!
//! Big-endian groups of 7 bits; every byte but the last has the high bit set.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

/// Longest encoding of a u64
const MAX_LEN: usize = 10;

/// Number of bytes `value` takes on the wire
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

pub fn write(buf: &mut impl BufMut, value: u64) {
    let len = encoded_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (7 * i)) & 0x7F) as u8;
        if i == 0 {
            buf.put_u8(group);
        } else {
            buf.put_u8(group | 0x80);
        }
    }
}

pub fn read(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    for _ in 0..MAX_LEN {
        if !buf.has_remaining() {
            return Err(Error::Decode("truncated variable length integer".to_string()));
        }
        let byte = buf.get_u8();
        value = (value << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Decode("variable length integer too long".to_string()))
}

/// Read a length-prefixed byte string
pub fn read_bytes(buf: &mut impl Buf) -> Result<bytes::Bytes> {
    let len = read(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::truncated(len, buf.remaining()));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Write a length-prefixed byte string
pub fn write_bytes(buf: &mut impl BufMut, data: &[u8]) {
    write(buf, data.len() as u64);
    buf.put_slice(data);
}
