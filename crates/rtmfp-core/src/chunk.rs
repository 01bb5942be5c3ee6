//! Chunk framing
//!
//! Every packet body is a list of `[type: u8][length: u16][body]` chunks
//! terminated by the end of the packet or by padding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ensure;
use crate::packet::PADDING;
use crate::{vlu, Error, Result};

/// Size of a chunk header
pub const CHUNK_HEADER_SIZE: usize = 3;

pub const IHELLO: u8 = 0x30;
pub const RHELLO: u8 = 0x70;
pub const REDIRECT: u8 = 0x71;
pub const FORWARDED_HELLO: u8 = 0x0F;
pub const IIKEYING: u8 = 0x38;
pub const RIKEYING: u8 = 0x78;
pub const USER_DATA: u8 = 0x10;
pub const NEXT_USER_DATA: u8 = 0x11;
pub const ACK: u8 = 0x51;
pub const EXCEPTION: u8 = 0x5E;
pub const PING: u8 = 0x01;
pub const PING_REPLY: u8 = 0x41;
pub const CLOSE: u8 = 0x0C;
pub const CLOSE_ACK: u8 = 0x4C;

/// One raw chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: u8,
    pub body: Bytes,
}

/// Iterates over the chunks of a decrypted packet body
pub struct ChunkReader {
    body: Bytes,
}

impl ChunkReader {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() || self.body[0] == PADDING {
            return None;
        }
        if self.body.len() < CHUNK_HEADER_SIZE {
            let have = self.body.len();
            self.body.clear();
            return Some(Err(Error::truncated(CHUNK_HEADER_SIZE, have)));
        }
        let kind = self.body.get_u8();
        let len = self.body.get_u16() as usize;
        if self.body.len() < len {
            let have = self.body.len();
            self.body.clear();
            return Some(Err(Error::chunk(
                kind,
                format!("length {} exceeds remaining {}", len, have),
            )));
        }
        let body = self.body.split_to(len);
        Some(Ok(Chunk { kind, body }))
    }
}

/// Accumulates chunks up to a size limit
#[derive(Debug)]
pub struct ChunkWriter {
    buf: BytesMut,
    limit: usize,
}

impl ChunkWriter {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit),
            limit,
        }
    }

    /// Append a chunk; returns false when it does not fit
    pub fn push(&mut self, kind: u8, body: &[u8]) -> bool {
        if !self.fits(body.len()) || body.len() > u16::MAX as usize {
            return false;
        }
        self.buf.put_u8(kind);
        self.buf.put_u16(body.len() as u16);
        self.buf.put_slice(body);
        true
    }

    /// Whether a chunk with this body length still fits
    pub fn fits(&self, body_len: usize) -> bool {
        self.buf.len() + CHUNK_HEADER_SIZE + body_len <= self.limit
    }

    /// Body bytes left for one more chunk
    pub fn remaining(&self) -> usize {
        self.limit
            .saturating_sub(self.buf.len())
            .saturating_sub(CHUNK_HEADER_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// User data fragment flags
pub mod flags {
    /// Header options follow
    pub const OPTIONS: u8 = 0x80;
    /// Fragment continues a message started in an earlier fragment
    pub const BEFORE_PART: u8 = 0x20;
    /// More fragments of this message follow
    pub const AFTER_PART: u8 = 0x10;
    /// Earlier fragments were abandoned
    pub const ABANDON: u8 = 0x02;
    /// Last fragment of the flow
    pub const FINAL: u8 = 0x01;
}

/// User data option carrying the flow signature
pub const OPTION_SIGNATURE: u8 = 0x00;
/// User data option naming the associated return flow
pub const OPTION_RETURN_FLOW: u8 = 0x0A;

/// One fragment of a flow message (chunks 0x10 and 0x11)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserData {
    pub flags: u8,
    pub flow_id: u64,
    pub sequence: u64,
    /// Distance from `sequence` back to the forward sequence number
    pub fsn_offset: u64,
    pub options: Vec<(u8, Bytes)>,
    pub payload: Bytes,
}

impl UserData {
    pub fn option(&self, kind: u8) -> Option<&Bytes> {
        self.options.iter().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }

    /// Whether this fragment can follow `previous` as a 0x11 chunk
    pub fn follows(&self, previous: &UserData) -> bool {
        self.options.is_empty()
            && self.flow_id == previous.flow_id
            && self.sequence == previous.sequence + 1
            && self.fsn_offset == previous.fsn_offset + 1
    }

    /// Encode as a full 0x10 chunk body
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = self.flags & !flags::OPTIONS;
        if !self.options.is_empty() {
            flags |= flags::OPTIONS;
        }
        buf.put_u8(flags);
        vlu::write(buf, self.flow_id);
        vlu::write(buf, self.sequence);
        vlu::write(buf, self.fsn_offset);
        if !self.options.is_empty() {
            for (kind, value) in &self.options {
                vlu::write(buf, (vlu::encoded_len(*kind as u64) + value.len()) as u64);
                vlu::write(buf, *kind as u64);
                buf.put_slice(value);
            }
            buf.put_u8(0);
        }
        buf.put_slice(&self.payload);
    }

    /// Encode as a 0x11 chunk body continuing the previous fragment
    pub fn encode_next(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags & !flags::OPTIONS);
        buf.put_slice(&self.payload);
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 1
            + vlu::encoded_len(self.flow_id)
            + vlu::encoded_len(self.sequence)
            + vlu::encoded_len(self.fsn_offset)
            + self.payload.len();
        if !self.options.is_empty() {
            for (kind, value) in &self.options {
                let inner = vlu::encoded_len(*kind as u64) + value.len();
                len += vlu::encoded_len(inner as u64) + inner;
            }
            len += 1;
        }
        len
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        ensure(body.len(), 1)?;
        let flags = body.get_u8();
        let flow_id = vlu::read(&mut body)?;
        let sequence = vlu::read(&mut body)?;
        let fsn_offset = vlu::read(&mut body)?;

        let mut options = Vec::new();
        if flags & flags::OPTIONS != 0 {
            loop {
                let len = vlu::read(&mut body)? as usize;
                if len == 0 {
                    break;
                }
                ensure(body.len(), len)?;
                let mut option = body.split_to(len);
                let kind = vlu::read(&mut option)?;
                options.push((kind as u8, option));
            }
        }

        Ok(Self {
            flags,
            flow_id,
            sequence,
            fsn_offset,
            options,
            payload: body,
        })
    }

    /// Decode a 0x11 chunk: same flow, next sequence number
    pub fn decode_next(mut body: Bytes, previous: &UserData) -> Result<Self> {
        ensure(body.len(), 1)?;
        let flags = body.get_u8();
        if flags & flags::OPTIONS != 0 {
            return Err(Error::chunk(NEXT_USER_DATA, "options are not allowed"));
        }
        Ok(Self {
            flags,
            flow_id: previous.flow_id,
            sequence: previous.sequence + 1,
            fsn_offset: previous.fsn_offset + 1,
            options: Vec::new(),
            payload: body,
        })
    }
}

/// Acknowledgement of a flow (chunk 0x51)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ack {
    pub flow_id: u64,
    /// Receive buffer space, in 1024-byte units
    pub buffer_available: u64,
    /// Every sequence number up to and including this one was received
    pub cumulative: u64,
    /// Selective ranges beyond `cumulative`, as (first, last) inclusive
    pub ranges: Vec<(u64, u64)>,
}

impl Ack {
    pub fn encode(&self, buf: &mut impl BufMut) {
        vlu::write(buf, self.flow_id);
        vlu::write(buf, self.buffer_available);
        vlu::write(buf, self.cumulative);
        let mut last = self.cumulative;
        for &(first, end) in &self.ranges {
            vlu::write(buf, first - last - 2);
            vlu::write(buf, end - first);
            last = end;
        }
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let flow_id = vlu::read(&mut body)?;
        let buffer_available = vlu::read(&mut body)?;
        let cumulative = vlu::read(&mut body)?;
        let mut ranges = Vec::new();
        let mut last = cumulative;
        while body.has_remaining() {
            let holes = vlu::read(&mut body)?;
            let received = vlu::read(&mut body)?;
            let first = last + holes + 2;
            let end = first + received;
            ranges.push((first, end));
            last = end;
        }
        Ok(Self {
            flow_id,
            buffer_available,
            cumulative,
            ranges,
        })
    }

    /// Whether `sequence` is covered by this acknowledgement
    pub fn covers(&self, sequence: u64) -> bool {
        sequence <= self.cumulative
            || self
                .ranges
                .iter()
                .any(|&(first, end)| sequence >= first && sequence <= end)
    }
}

/// Flow rejection (chunk 0x5E)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowException {
    pub flow_id: u64,
    pub code: u64,
}

impl FlowException {
    pub fn encode(&self, buf: &mut impl BufMut) {
        vlu::write(buf, self.flow_id);
        vlu::write(buf, self.code);
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let flow_id = vlu::read(&mut body)?;
        let code = vlu::read(&mut body)?;
        Ok(Self { flow_id, code })
    }
}
