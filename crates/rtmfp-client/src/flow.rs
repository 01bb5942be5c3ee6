//! Message flows inside a session

use bytes::{Bytes, BytesMut};
use rtmfp_core::chunk::{flags, Ack, UserData, OPTION_RETURN_FLOW, OPTION_SIGNATURE};
use rtmfp_core::vlu;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::trace;

/// Signature of the NetConnection flow
pub const NET_CONNECTION_SIGNATURE: &[u8] = b"\x00TC\x04\x00";

/// Prefix of NetConnection and NetStream signatures
const STREAM_PREFIX: &[u8] = b"\x00TC\x04";

/// Signature of group control flows
pub const GROUP_CONTROL_SIGNATURE: &[u8] = b"\x00GC";

/// Signature of group media flows
pub const GROUP_MEDIA_SIGNATURE: &[u8] = b"\x00GM";

/// Largest payload carried by one fragment
pub const FRAGMENT_SIZE: usize = 1100;

/// Unacknowledged reliable fragments are resent after this delay
pub const RETRANSMIT_AFTER: Duration = Duration::from_secs(1);

/// Fragments further than this ahead of the last in-order one are dropped
pub const MAX_WINDOW: u64 = 4096;

/// Signature of the NetStream flow for `stream_id`
pub fn stream_signature(stream_id: u32) -> Bytes {
    let mut buf = BytesMut::from(STREAM_PREFIX);
    vlu::write(&mut buf, stream_id as u64);
    buf.freeze()
}

/// Stream ID of a NetConnection (0) or NetStream signature
pub fn parse_stream_signature(signature: &[u8]) -> Option<u32> {
    let mut rest = signature.strip_prefix(STREAM_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    vlu::read(&mut rest).ok().map(|id| id as u32)
}

#[derive(Debug)]
struct Fragment {
    sequence: u64,
    flags: u8,
    payload: Bytes,
    /// First sequence number of the message this fragment belongs to
    message_start: u64,
    sent_at: Option<Instant>,
}

/// Sending half of a flow
#[derive(Debug)]
pub struct FlowWriter {
    id: u64,
    signature: Bytes,
    return_flow: Option<u64>,
    reliable: bool,
    next_sequence: u64,
    acknowledged: u64,
    queue: VecDeque<Fragment>,
    opened: bool,
    closed: bool,
}

impl FlowWriter {
    pub fn new(id: u64, signature: impl Into<Bytes>, return_flow: Option<u64>) -> Self {
        Self {
            id,
            signature: signature.into(),
            return_flow,
            reliable: true,
            next_sequence: 1,
            acknowledged: 0,
            queue: VecDeque::new(),
            opened: false,
            closed: false,
        }
    }

    /// Drop fragments once sent instead of waiting for acknowledgement
    pub fn unreliable(mut self) -> Self {
        self.reliable = false;
        self
    }

    /// Queue one message, fragmented as needed
    pub fn write(&mut self, message: Bytes) {
        if self.closed {
            return;
        }
        let start = self.next_sequence;
        let count = message.len().div_ceil(FRAGMENT_SIZE).max(1);
        for index in 0..count {
            let from = (index * FRAGMENT_SIZE).min(message.len());
            let to = ((index + 1) * FRAGMENT_SIZE).min(message.len());
            let mut fragment_flags = 0;
            if index > 0 {
                fragment_flags |= flags::BEFORE_PART;
            }
            if index + 1 < count {
                fragment_flags |= flags::AFTER_PART;
            }
            self.push(fragment_flags, message.slice(from..to), start);
        }
    }

    /// Queue the final fragment; the flow is done once it is acknowledged
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let start = self.next_sequence;
        self.push(flags::FINAL, Bytes::new(), start);
        self.closed = true;
    }

    fn push(&mut self, flags: u8, payload: Bytes, message_start: u64) {
        self.queue.push_back(Fragment {
            sequence: self.next_sequence,
            flags,
            payload,
            message_start,
            sent_at: None,
        });
        self.next_sequence += 1;
    }

    pub fn on_ack(&mut self, ack: &Ack) {
        self.opened = true;
        // nothing past what we sent can be acknowledged
        let sent = self.next_sequence - 1;
        self.acknowledged = self.acknowledged.max(ack.cumulative.min(sent));
        self.queue.retain(|fragment| !ack.covers(fragment.sequence));
    }

    /// The far end refused the flow
    pub fn on_exception(&mut self) {
        self.queue.clear();
        self.closed = true;
    }

    /// Fragments due now: unsent ones, plus reliable ones past the
    /// retransmission delay
    pub fn poll(&mut self, now: Instant) -> Vec<UserData> {
        let mut out = Vec::new();
        for fragment in self.queue.iter_mut() {
            let due = match fragment.sent_at {
                None => true,
                Some(sent) => self.reliable && now.duration_since(sent) >= RETRANSMIT_AFTER,
            };
            if !due {
                continue;
            }
            fragment.sent_at = Some(now);

            let forward = if self.reliable {
                self.acknowledged
            } else {
                fragment.message_start - 1
            };
            let mut options = Vec::new();
            if !self.opened {
                options.push((OPTION_SIGNATURE, self.signature.clone()));
                if let Some(flow) = self.return_flow {
                    let mut value = BytesMut::new();
                    vlu::write(&mut value, flow);
                    options.push((OPTION_RETURN_FLOW, value.freeze()));
                }
            }
            out.push(UserData {
                flags: fragment.flags,
                flow_id: self.id,
                sequence: fragment.sequence,
                fsn_offset: fragment.sequence.saturating_sub(forward),
                options,
                payload: fragment.payload.clone(),
            });
        }
        if !self.reliable {
            self.queue.retain(|fragment| fragment.sent_at.is_none());
        }
        out
    }

    /// Closed and everything acknowledged
    pub fn is_finished(&self) -> bool {
        self.closed && self.queue.is_empty()
    }
}

/// Receiving half of a flow
#[derive(Debug)]
pub struct FlowReader {
    id: u64,
    signature: Bytes,
    received: u64,
    pending: BTreeMap<u64, (u8, Bytes)>,
    partial: Option<BytesMut>,
    ack_needed: bool,
    finished: bool,
}

impl FlowReader {
    /// Reader for a flow announced by `first` fragment's options
    pub fn open(first: &UserData) -> Self {
        let signature = first.option(OPTION_SIGNATURE).cloned().unwrap_or_default();
        Self {
            id: first.flow_id,
            signature,
            received: 0,
            pending: BTreeMap::new(),
            partial: None,
            ack_needed: false,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Accept one fragment; returns the messages it completes, in order
    pub fn on_fragment(&mut self, data: &UserData) -> Vec<Bytes> {
        let Some(limit) = self.received.checked_add(MAX_WINDOW) else {
            return Vec::new();
        };
        if data.sequence > limit {
            trace!(
                "Flow {}: dropping fragment {} beyond window {}",
                self.id, data.sequence, limit
            );
            return Vec::new();
        }
        self.ack_needed = true;

        let forward = data.sequence.saturating_sub(data.fsn_offset);
        if forward > self.received {
            // everything up to the forward sequence number is abandoned
            self.pending = match forward.checked_add(1) {
                Some(next) => self.pending.split_off(&next),
                None => BTreeMap::new(),
            };
            self.partial = None;
            self.received = forward;
        }
        if data.sequence > self.received {
            self.pending
                .insert(data.sequence, (data.flags, data.payload.clone()));
        }

        let mut messages = Vec::new();
        while let Some(next) = self.received.checked_add(1) {
            let Some((flags, payload)) = self.pending.remove(&next) else {
                break;
            };
            self.received = next;
            if flags & flags::FINAL != 0 {
                self.finished = true;
            }
            if flags & flags::ABANDON != 0 {
                self.partial = None;
                continue;
            }
            if flags & flags::BEFORE_PART == 0 {
                self.partial = Some(BytesMut::new());
            }
            let Some(partial) = self.partial.as_mut() else {
                // head of this message was abandoned
                continue;
            };
            partial.extend_from_slice(&payload);
            if flags & flags::AFTER_PART == 0 {
                if let Some(message) = self.partial.take() {
                    if !message.is_empty() || flags & flags::FINAL == 0 {
                        messages.push(message.freeze());
                    }
                }
            }
        }
        messages
    }

    /// Acknowledgement to send, if anything arrived since the last one
    pub fn take_ack(&mut self) -> Option<Ack> {
        if !self.ack_needed {
            return None;
        }
        self.ack_needed = false;
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for &sequence in self.pending.keys() {
            match ranges.last_mut() {
                Some((_, end)) if end.checked_add(1) == Some(sequence) => *end = sequence,
                _ => ranges.push((sequence, sequence)),
            }
        }
        Some(Ack {
            flow_id: self.id,
            buffer_available: 0x7F,
            cumulative: self.received,
            ranges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_reader(writer: &mut FlowWriter, now: Instant) -> (FlowReader, Vec<UserData>) {
        let fragments = writer.poll(now);
        let reader = FlowReader::open(&fragments[0]);
        (reader, fragments)
    }

    #[test]
    fn test_stream_signatures() {
        assert_eq!(&stream_signature(0)[..], NET_CONNECTION_SIGNATURE);
        assert_eq!(parse_stream_signature(NET_CONNECTION_SIGNATURE), Some(0));
        assert_eq!(parse_stream_signature(&stream_signature(300)), Some(300));
        assert_eq!(parse_stream_signature(GROUP_MEDIA_SIGNATURE), None);
    }

    #[test]
    fn test_large_message_is_fragmented_and_reassembled() {
        let now = Instant::now();
        let mut writer = FlowWriter::new(2, NET_CONNECTION_SIGNATURE, Some(1));
        let message = Bytes::from(vec![7u8; FRAGMENT_SIZE * 2 + 10]);
        writer.write(message.clone());

        let (mut reader, fragments) = open_reader(&mut writer, now);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].flags, flags::AFTER_PART);
        assert_eq!(fragments[1].flags, flags::BEFORE_PART | flags::AFTER_PART);
        assert_eq!(fragments[2].flags, flags::BEFORE_PART);
        assert_eq!(reader.signature(), NET_CONNECTION_SIGNATURE);
        assert_eq!(fragments[0].option(OPTION_RETURN_FLOW).map(|v| &v[..]), Some(&[1u8][..]));

        // out of order delivery
        assert!(reader.on_fragment(&fragments[2]).is_empty());
        assert!(reader.on_fragment(&fragments[0]).is_empty());
        let ack = reader.take_ack().unwrap();
        assert_eq!(ack.cumulative, 1);
        assert_eq!(ack.ranges, vec![(3, 3)]);

        let messages = reader.on_fragment(&fragments[1]);
        assert_eq!(messages, vec![message]);
    }

    #[test]
    fn test_ack_stops_retransmission() {
        let now = Instant::now();
        let mut writer = FlowWriter::new(2, NET_CONNECTION_SIGNATURE, None);
        writer.write(Bytes::from_static(b"one"));
        writer.write(Bytes::from_static(b"two"));
        let (mut reader, fragments) = open_reader(&mut writer, now);
        assert_eq!(fragments.len(), 2);

        // not due yet
        assert!(writer.poll(now + Duration::from_millis(10)).is_empty());

        reader.on_fragment(&fragments[0]);
        writer.on_ack(&reader.take_ack().unwrap());

        let resent = writer.poll(now + RETRANSMIT_AFTER);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sequence, 2);
        assert!(resent[0].options.is_empty());
    }

    #[test]
    fn test_unreliable_flow_skips_lost_messages() {
        let now = Instant::now();
        let mut writer = FlowWriter::new(3, stream_signature(1), None).unreliable();
        writer.write(Bytes::from_static(b"lost"));
        let (mut reader, _lost) = open_reader(&mut writer, now);
        assert!(writer.poll(now + RETRANSMIT_AFTER).is_empty());

        writer.write(Bytes::from_static(b"kept"));
        let fragments = writer.poll(now);
        assert_eq!(fragments[0].fsn_offset, 1);
        assert_eq!(
            reader.on_fragment(&fragments[0]),
            vec![Bytes::from_static(b"kept")]
        );
    }

    #[test]
    fn test_close_marks_final() {
        let now = Instant::now();
        let mut writer = FlowWriter::new(4, GROUP_MEDIA_SIGNATURE, None);
        writer.write(Bytes::from_static(b"last"));
        writer.close();
        writer.write(Bytes::from_static(b"ignored"));
        let (mut reader, fragments) = open_reader(&mut writer, now);
        assert_eq!(fragments.len(), 2);

        let mut messages = Vec::new();
        for fragment in &fragments {
            messages.extend(reader.on_fragment(fragment));
        }
        assert_eq!(messages, vec![Bytes::from_static(b"last")]);
        assert!(reader.is_finished());

        writer.on_ack(&reader.take_ack().unwrap());
        assert!(writer.is_finished());
    }

    #[test]
    fn test_fragments_far_ahead_are_dropped() {
        let now = Instant::now();
        let mut writer = FlowWriter::new(5, NET_CONNECTION_SIGNATURE, None);
        writer.write(Bytes::from_static(b"first"));
        writer.write(Bytes::from_static(b"second"));
        let (mut reader, fragments) = open_reader(&mut writer, now);

        let mut hostile = fragments[0].clone();
        hostile.sequence = u64::MAX;
        hostile.fsn_offset = 0;
        assert!(reader.on_fragment(&hostile).is_empty());

        let mut ahead = fragments[0].clone();
        ahead.sequence = MAX_WINDOW + 2;
        ahead.fsn_offset = ahead.sequence;
        assert!(reader.on_fragment(&ahead).is_empty());
        assert!(reader.take_ack().is_none());

        assert_eq!(
            reader.on_fragment(&fragments[0]),
            vec![Bytes::from_static(b"first")]
        );
        assert_eq!(
            reader.on_fragment(&fragments[1]),
            vec![Bytes::from_static(b"second")]
        );
        let ack = reader.take_ack().unwrap();
        assert_eq!(ack.cumulative, 2);
        assert!(ack.ranges.is_empty());
    }

    #[test]
    fn test_ack_beyond_sent_is_clamped() {
        let now = Instant::now();
        let mut writer = FlowWriter::new(6, NET_CONNECTION_SIGNATURE, None);
        writer.write(Bytes::from_static(b"one"));
        writer.poll(now);
        writer.on_ack(&Ack {
            flow_id: 6,
            buffer_available: 0x7F,
            cumulative: u64::MAX,
            ranges: Vec::new(),
        });
        writer.write(Bytes::from_static(b"two"));
        let fragments = writer.poll(now);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].sequence, 2);
        assert_eq!(fragments[0].fsn_offset, 1);
    }
}
