//! Datagram framing
//!
//! RTMFP datagram format:
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Byte 0-3:   Scrambled session ID (see session_id)               │
//! ├──────────────────────── encrypted ──────────────────────────────┤
//! │ Byte 4-5:   Checksum of everything after it                     │
//! │ Byte 6:     Marker                                              │
//! │             0x0B handshake, 0x89 initiator, 0x4A responder      │
//! │             [2] echo time present                               │
//! │ Byte 7-8:   Sender time (scaled, see time)                      │
//! │ [If echo]   Byte 9-10: Echoed far time                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Chunks, then 0xFF padding to a 16-byte boundary                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::cipher::{Engine, BLOCK_SIZE};
use crate::session_id::{self, SESSION_ID_SIZE};
use crate::time::{self, Timestamp};
use crate::{Error, Result, MAX_PACKET_SIZE, MIN_PACKET_SIZE};

/// Padding byte; also terminates the chunk list
pub const PADDING: u8 = 0xFF;

/// Packet marker byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker(pub u8);

impl Marker {
    pub const HANDSHAKE: Marker = Marker(0x0B);
    pub const INITIATOR: Marker = Marker(0x89);
    pub const RESPONDER: Marker = Marker(0x4A);
    pub const ECHO_FLAG: u8 = 0x04;

    pub fn has_echo(self) -> bool {
        self.0 & Self::ECHO_FLAG != 0
    }

    pub fn with_echo(self, echo: bool) -> Self {
        if echo {
            Marker(self.0 | Self::ECHO_FLAG)
        } else {
            Marker(self.0 & !Self::ECHO_FLAG)
        }
    }

    pub fn is_handshake(self) -> bool {
        self.0 == Self::HANDSHAKE.0
    }
}

/// One-complement 16-bit sum used by the header checksum
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += *last as u32;
    }
    sum = (sum >> 16) + (sum & 0xFFFF);
    sum += sum >> 16;
    !(sum as u16)
}

/// A decrypted datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub marker: Marker,
    pub time: Timestamp,
    pub echo: Option<Timestamp>,
    /// Chunk list, padding included
    pub body: Bytes,
}

impl Packet {
    /// Create a packet stamped with the current time
    pub fn new(marker: Marker, body: impl Into<Bytes>) -> Self {
        Self {
            marker,
            time: time::time_now(),
            echo: None,
            body: body.into(),
        }
    }

    /// Attach an echo timestamp
    pub fn with_echo(mut self, echo: Option<Timestamp>) -> Self {
        self.echo = echo;
        self.marker = self.marker.with_echo(echo.is_some());
        self
    }

    /// Header length including the session ID field
    pub fn header_len(&self) -> usize {
        SESSION_ID_SIZE + 2 + 1 + 2 + if self.echo.is_some() { 2 } else { 0 }
    }

    /// Space left for chunks in a datagram with this header
    pub fn capacity(echo: bool) -> usize {
        let header = SESSION_ID_SIZE + 2 + 1 + 2 + if echo { 2 } else { 0 };
        let encrypted = (MAX_PACKET_SIZE - SESSION_ID_SIZE) / BLOCK_SIZE * BLOCK_SIZE;
        encrypted + SESSION_ID_SIZE - header
    }

    /// Encrypt and frame for the session identified by `far_id`
    pub fn encode(&self, far_id: u32, engine: &Engine) -> Result<Bytes> {
        let plain = self.header_len() + self.body.len();
        let encrypted_len = (plain - SESSION_ID_SIZE).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let total = SESSION_ID_SIZE + encrypted_len;
        if total > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(0);
        buf.put_u16(0);
        buf.put_u8(self.marker.0);
        buf.put_u16(self.time);
        if let Some(echo) = self.echo {
            buf.put_u16(echo);
        }
        buf.put_slice(&self.body);
        buf.resize(total, PADDING);

        let sum = checksum(&buf[SESSION_ID_SIZE + 2..]);
        buf[SESSION_ID_SIZE..SESSION_ID_SIZE + 2].copy_from_slice(&sum.to_be_bytes());

        engine.process(&mut buf[SESSION_ID_SIZE..])?;
        session_id::pack(&mut buf, far_id)?;
        Ok(buf.freeze())
    }

    /// Decrypt and parse a datagram. The session ID is read separately with
    /// [`session_id::unpack`] to pick the right engine.
    pub fn decode(data: &[u8], engine: &Engine) -> Result<Self> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(Error::truncated(MIN_PACKET_SIZE, data.len()));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(data.len()));
        }

        let mut plain = data[SESSION_ID_SIZE..].to_vec();
        engine.process(&mut plain)?;

        let expected = u16::from_be_bytes([plain[0], plain[1]]);
        let actual = checksum(&plain[2..]);
        if expected != actual {
            return Err(Error::InvalidChecksum { expected, actual });
        }

        let marker = Marker(plain[2]);
        let time = u16::from_be_bytes([plain[3], plain[4]]);
        let (echo, offset) = if marker.has_echo() {
            if plain.len() < 7 {
                return Err(Error::truncated(7, plain.len()));
            }
            (Some(u16::from_be_bytes([plain[5], plain[6]])), 7)
        } else {
            (None, 5)
        };

        let body = Bytes::from(plain).slice(offset..);
        Ok(Self {
            marker,
            time,
            echo,
            body,
        })
    }
}
