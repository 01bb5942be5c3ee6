//! FLV container at the read/write boundary
//!
//! Readers receive an FLV header followed by tags; writers may push an FLV
//! stream split at arbitrary points.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// `FLV`, version 1, audio and video present, header size 9, then the first
/// previous-tag-size field
pub const FLV_HEADER: [u8; 13] = [b'F', b'L', b'V', 0x01, 0x05, 0, 0, 0, 0x09, 0, 0, 0, 0];

const TAG_HEADER_SIZE: usize = 11;
const PREVIOUS_SIZE: usize = 4;

/// Tag types
pub const AUDIO: u8 = 0x08;
pub const VIDEO: u8 = 0x09;
pub const DATA: u8 = 0x12;

/// One FLV tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub kind: u8,
    /// Milliseconds
    pub time: u32,
    pub data: Bytes,
}

impl FlvTag {
    pub fn encoded_len(&self) -> usize {
        TAG_HEADER_SIZE + self.data.len() + PREVIOUS_SIZE
    }

    /// Tag header, data and the trailing previous-tag-size
    pub fn encode(&self, buf: &mut impl BufMut) {
        let size = self.data.len() as u32;
        buf.put_u8(self.kind);
        put_u24(buf, size);
        put_u24(buf, self.time & 0x00FF_FFFF);
        buf.put_u8((self.time >> 24) as u8);
        put_u24(buf, 0);
        buf.put_slice(&self.data);
        buf.put_u32(TAG_HEADER_SIZE as u32 + size);
    }
}

fn put_u24(buf: &mut impl BufMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u16(value as u16);
}

fn get_u24(buf: &mut impl Buf) -> u32 {
    let high = buf.get_u8() as u32;
    (high << 16) | buf.get_u16() as u32
}

/// Incremental FLV parser
#[derive(Debug, Default)]
pub struct FlvReader {
    buf: BytesMut,
    header_checked: bool,
}

impl FlvReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of a tag
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete tag, if one is buffered
    pub fn next_tag(&mut self) -> Result<Option<FlvTag>> {
        if !self.header_checked {
            if self.buf.len() < 3 {
                return Ok(None);
            }
            if &self.buf[..3] == b"FLV" {
                if self.buf.len() < FLV_HEADER.len() {
                    return Ok(None);
                }
                let header_size =
                    u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]])
                        as usize;
                if header_size < 9 {
                    return Err(Error::Flv(format!("header size {}", header_size)));
                }
                if self.buf.len() < header_size + PREVIOUS_SIZE {
                    return Ok(None);
                }
                self.buf.advance(header_size + PREVIOUS_SIZE);
            }
            self.header_checked = true;
        }

        if self.buf.len() < TAG_HEADER_SIZE {
            return Ok(None);
        }
        let kind = self.buf[0] & 0x1F;
        let size = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let total = TAG_HEADER_SIZE + size + PREVIOUS_SIZE;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut tag = self.buf.split_to(total);
        tag.advance(4);
        let low = get_u24(&mut tag);
        let extended = tag.get_u8() as u32;
        let _stream_id = get_u24(&mut tag);
        let data = tag.split_to(size).freeze();
        Ok(Some(FlvTag {
            kind,
            time: (extended << 24) | low,
            data,
        }))
    }
}
