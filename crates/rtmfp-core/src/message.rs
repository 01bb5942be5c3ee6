//! Flash messages carried on flows
//!
//! `[type: u8][time: u32][payload]`; invocations add one zero byte before
//! their AMF0 payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ensure;
use crate::flv::{self, FlvTag};
use crate::{Error, Result};

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Stream control event (u16 event type + u32 stream id)
    Raw = 0x04,
    Audio = 0x08,
    Video = 0x09,
    /// AMF0 data message, e.g. `@setDataFrame`
    Data = 0x12,
    /// AMF0 command
    Invocation = 0x14,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x04 => Some(MessageType::Raw),
            0x08 => Some(MessageType::Audio),
            0x09 => Some(MessageType::Video),
            0x12 => Some(MessageType::Data),
            0x14 => Some(MessageType::Invocation),
            _ => None,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(self, MessageType::Audio | MessageType::Video)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub time: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, time: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            time,
            payload: payload.into(),
        }
    }

    pub fn invocation(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Invocation, 0, payload)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6 + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.time);
        if self.kind == MessageType::Invocation {
            buf.put_u8(0);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        ensure(data.len(), 5)?;
        let raw = data.get_u8();
        let kind = MessageType::from_u8(raw)
            .ok_or_else(|| Error::Decode(format!("unknown message type 0x{:02x}", raw)))?;
        let time = data.get_u32();
        if kind == MessageType::Invocation {
            ensure(data.len(), 1)?;
            data.advance(1);
        }
        Ok(Self {
            kind,
            time,
            payload: data,
        })
    }

    /// FLV tag for audio, video and data messages
    pub fn to_flv_tag(&self) -> Option<FlvTag> {
        let kind = match self.kind {
            MessageType::Audio => flv::AUDIO,
            MessageType::Video => flv::VIDEO,
            MessageType::Data => flv::DATA,
            _ => return None,
        };
        Some(FlvTag {
            kind,
            time: self.time,
            data: self.payload.clone(),
        })
    }

    pub fn from_flv_tag(tag: &FlvTag) -> Option<Self> {
        let kind = match tag.kind {
            flv::AUDIO => MessageType::Audio,
            flv::VIDEO => MessageType::Video,
            flv::DATA => MessageType::Data,
            _ => return None,
        };
        Some(Self::new(kind, tag.time, tag.data.clone()))
    }
}
