//! Established sessions: keyed packet exchange, flows, keepalive and close

use bytes::{Bytes, BytesMut};
use rtmfp_core::chunk::{self, Ack, ChunkReader, ChunkWriter, FlowException, UserData};
use rtmfp_core::handshake::ForwardedHello;
use rtmfp_core::time::{self, Timestamp};
use rtmfp_core::{Engine, Marker, Packet, PeerId, SessionKeys};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::flow::{FlowReader, FlowWriter};

/// Idle time before a ping is sent
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(15);

/// Silence after which the session is considered dead
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(95);

/// Time allowed for the far end to acknowledge a close
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Echo times are only sent for packets received this recently
const ECHO_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing(Instant),
    Closed,
}

/// Something the owner of a session has to act on
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete message on an incoming flow
    Message {
        flow_id: u64,
        signature: Bytes,
        message: Bytes,
    },
    /// The server relayed a peer's hello to us
    ForwardedHello(ForwardedHello),
    /// The far end finished or refused one of our flows
    FlowClosed(u64),
    /// Closed by either side
    Closed,
    /// No traffic for [`SESSION_TIMEOUT`]
    Failed(String),
}

/// One keyed session with a server or a peer
pub struct Session {
    near_id: u32,
    far_id: u32,
    address: SocketAddr,
    peer_id: Option<PeerId>,
    marker: Marker,
    encoder: Engine,
    decoder: Engine,
    writers: BTreeMap<u64, FlowWriter>,
    readers: BTreeMap<u64, FlowReader>,
    next_flow: u64,
    control: Vec<(u8, Bytes)>,
    far_time: Option<(Timestamp, Instant)>,
    last_received: Instant,
    last_sent: Instant,
    ping_sent: Option<Instant>,
    state: SessionState,
}

impl Session {
    /// Session on our side of a completed handshake
    pub fn new(
        near_id: u32,
        far_id: u32,
        address: SocketAddr,
        keys: &SessionKeys,
        initiator: bool,
        now: Instant,
    ) -> Self {
        let (encoder, decoder, marker) = if initiator {
            let (e, d) = keys.initiator_engines();
            (e, d, Marker::INITIATOR)
        } else {
            let (e, d) = keys.responder_engines();
            (e, d, Marker::RESPONDER)
        };
        Self {
            near_id,
            far_id,
            address,
            peer_id: None,
            marker,
            encoder,
            decoder,
            writers: BTreeMap::new(),
            readers: BTreeMap::new(),
            next_flow: 1,
            control: Vec::new(),
            far_time: None,
            last_received: now,
            last_sent: now,
            ping_sent: None,
            state: SessionState::Open,
        }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Open a flow towards the far end
    pub fn open_flow(&mut self, signature: impl Into<Bytes>, return_flow: Option<u64>, reliable: bool) -> u64 {
        let id = self.next_flow;
        self.next_flow += 1;
        let mut writer = FlowWriter::new(id, signature, return_flow);
        if !reliable {
            writer = writer.unreliable();
        }
        self.writers.insert(id, writer);
        id
    }

    /// Queue a message on one of our flows; false if the flow is gone
    pub fn send(&mut self, flow_id: u64, message: Bytes) -> bool {
        match self.writers.get_mut(&flow_id) {
            Some(writer) => {
                writer.write(message);
                true
            }
            None => false,
        }
    }

    pub fn close_flow(&mut self, flow_id: u64) {
        if let Some(writer) = self.writers.get_mut(&flow_id) {
            writer.close();
        }
    }

    /// Start closing; the session ends on close ack or after [`CLOSE_TIMEOUT`]
    pub fn close(&mut self, now: Instant) {
        if self.state == SessionState::Open {
            debug!("Closing session {} to {}", self.near_id, self.address);
            self.control.push((chunk::CLOSE, Bytes::new()));
            self.state = SessionState::Closing(now);
        }
    }

    /// Decrypt a datagram addressed to this session
    pub fn decode(&self, data: &[u8]) -> rtmfp_core::Result<Packet> {
        Packet::decode(data, &self.decoder)
    }

    /// Handle a decrypted packet
    pub fn on_packet(&mut self, packet: Packet, from: SocketAddr, now: Instant) -> Vec<SessionEvent> {
        self.last_received = now;
        self.ping_sent = None;
        self.far_time = Some((packet.time, now));
        if from != self.address {
            debug!("Session {} moved from {} to {}", self.near_id, self.address, from);
            self.address = from;
        }

        let mut events = Vec::new();
        let mut previous: Option<UserData> = None;
        for item in ChunkReader::new(packet.body) {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("Session {}: {}", self.near_id, e);
                    break;
                }
            };
            let result = match chunk.kind {
                chunk::USER_DATA => UserData::decode(chunk.body).map(|data| {
                    self.on_user_data(&data, &mut events);
                    previous = Some(data);
                }),
                chunk::NEXT_USER_DATA => match previous.take() {
                    Some(prev) => UserData::decode_next(chunk.body, &prev).map(|data| {
                        self.on_user_data(&data, &mut events);
                        previous = Some(data);
                    }),
                    None => Ok(()),
                },
                chunk::ACK => Ack::decode(chunk.body).map(|ack| {
                    if let Some(writer) = self.writers.get_mut(&ack.flow_id) {
                        writer.on_ack(&ack);
                        if writer.is_finished() {
                            self.writers.remove(&ack.flow_id);
                            events.push(SessionEvent::FlowClosed(ack.flow_id));
                        }
                    }
                }),
                chunk::EXCEPTION => FlowException::decode(chunk.body).map(|exception| {
                    debug!(
                        "Session {}: flow {} rejected with code {}",
                        self.near_id, exception.flow_id, exception.code
                    );
                    if let Some(writer) = self.writers.get_mut(&exception.flow_id) {
                        writer.on_exception();
                        if writer.is_finished() {
                            self.writers.remove(&exception.flow_id);
                            events.push(SessionEvent::FlowClosed(exception.flow_id));
                        }
                    }
                }),
                chunk::FORWARDED_HELLO => ForwardedHello::decode(chunk.body)
                    .map(|hello| events.push(SessionEvent::ForwardedHello(hello))),
                chunk::PING => {
                    self.control.push((chunk::PING_REPLY, chunk.body));
                    Ok(())
                }
                chunk::PING_REPLY => Ok(()),
                chunk::CLOSE => {
                    self.control.push((chunk::CLOSE_ACK, Bytes::new()));
                    self.state = SessionState::Closed;
                    events.push(SessionEvent::Closed);
                    Ok(())
                }
                chunk::CLOSE_ACK => {
                    if self.state != SessionState::Closed {
                        self.state = SessionState::Closed;
                        events.push(SessionEvent::Closed);
                    }
                    Ok(())
                }
                other => {
                    trace!("Session {}: ignoring chunk 0x{:02x}", self.near_id, other);
                    Ok(())
                }
            };
            if let Err(e) = result {
                debug!("Session {}: dropping chunk: {}", self.near_id, e);
            }
        }
        events
    }

    fn on_user_data(&mut self, data: &UserData, events: &mut Vec<SessionEvent>) {
        if !self.readers.contains_key(&data.flow_id) {
            if data.option(chunk::OPTION_SIGNATURE).is_none() {
                // first fragments were lost, wait for a retransmission
                trace!("Session {}: unknown flow {}", self.near_id, data.flow_id);
                return;
            }
            self.readers.insert(data.flow_id, FlowReader::open(data));
        }
        let Some(reader) = self.readers.get_mut(&data.flow_id) else {
            return;
        };
        for message in reader.on_fragment(data) {
            events.push(SessionEvent::Message {
                flow_id: reader.id(),
                signature: reader.signature().clone(),
                message,
            });
        }
    }

    /// Check keepalive and close timers
    pub fn on_tick(&mut self, now: Instant) -> Option<SessionEvent> {
        match self.state {
            SessionState::Closed => None,
            SessionState::Closing(since) => {
                if now.duration_since(since) >= CLOSE_TIMEOUT {
                    self.state = SessionState::Closed;
                    return Some(SessionEvent::Closed);
                }
                None
            }
            SessionState::Open => {
                let silence = now.duration_since(self.last_received);
                if silence >= SESSION_TIMEOUT {
                    self.state = SessionState::Closed;
                    return Some(SessionEvent::Failed(format!(
                        "no answer from {} for {}s",
                        self.address,
                        silence.as_secs()
                    )));
                }
                let idle = silence.min(now.duration_since(self.last_sent));
                let ping_due = self
                    .ping_sent
                    .map_or(true, |sent| now.duration_since(sent) >= KEEPALIVE_AFTER);
                if idle >= KEEPALIVE_AFTER && ping_due {
                    self.control.push((chunk::PING, Bytes::new()));
                    self.ping_sent = Some(now);
                }
                None
            }
        }
    }

    fn echo_time(&self, now: Instant) -> Option<Timestamp> {
        let (far_time, received) = self.far_time?;
        let since = now.duration_since(received);
        if since > ECHO_WINDOW {
            return None;
        }
        Some(far_time.wrapping_add(time::from_duration(since)))
    }

    /// Pack everything due into packets: control chunks and acks first,
    /// then flow data
    pub fn poll(&mut self, now: Instant) -> Vec<Packet> {
        let mut chunks: Vec<(u8, Bytes)> = std::mem::take(&mut self.control);
        for reader in self.readers.values_mut() {
            if let Some(ack) = reader.take_ack() {
                let mut body = BytesMut::new();
                ack.encode(&mut body);
                chunks.push((chunk::ACK, body.freeze()));
            }
        }
        self.readers.retain(|_, reader| !reader.is_finished());

        let mut fragments = Vec::new();
        if self.state == SessionState::Open {
            for writer in self.writers.values_mut() {
                fragments.extend(writer.poll(now));
            }
        }
        if chunks.is_empty() && fragments.is_empty() {
            return Vec::new();
        }

        let echo = self.echo_time(now);
        let limit = Packet::capacity(echo.is_some());
        let mut packets = Vec::new();
        let mut writer = ChunkWriter::new(limit);
        let mut previous: Option<UserData> = None;

        for (kind, body) in chunks {
            if !writer.fits(body.len()) {
                packets.push(std::mem::replace(&mut writer, ChunkWriter::new(limit)));
            }
            writer.push(kind, &body);
        }
        for fragment in fragments {
            let mut body = BytesMut::new();
            let kind = match previous.as_ref() {
                Some(prev) if fragment.follows(prev) && writer.fits(fragment.payload.len() + 1) => {
                    fragment.encode_next(&mut body);
                    chunk::NEXT_USER_DATA
                }
                _ => {
                    fragment.encode(&mut body);
                    chunk::USER_DATA
                }
            };
            if !writer.fits(body.len()) {
                packets.push(std::mem::replace(&mut writer, ChunkWriter::new(limit)));
                // a new packet cannot start with a continuation
                body.clear();
                fragment.encode(&mut body);
                writer.push(chunk::USER_DATA, &body);
            } else {
                writer.push(kind, &body);
            }
            previous = Some(fragment);
        }
        if !writer.is_empty() {
            packets.push(writer);
        }

        self.last_sent = now;
        packets
            .into_iter()
            .map(|chunks| Packet::new(self.marker, chunks.into_bytes()).with_echo(echo))
            .collect()
    }

    /// Encrypt a packet for the far end
    pub fn encode(&self, packet: &Packet) -> rtmfp_core::Result<Bytes> {
        packet.encode(self.far_id, &self.encoder)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("near_id", &self.near_id)
            .field("far_id", &self.far_id)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("writers", &self.writers.len())
            .field("readers", &self.readers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{NET_CONNECTION_SIGNATURE, RETRANSMIT_AFTER};
    use rtmfp_core::compute_asymmetric_keys;

    fn pair(now: Instant) -> (Session, Session) {
        let keys = compute_asymmetric_keys(b"shared", b"initiator", b"responder");
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2000".parse().unwrap();
        (
            Session::new(11, 22, b, &keys, true, now),
            Session::new(22, 11, a, &keys, false, now),
        )
    }

    fn deliver(from: &mut Session, to: &mut Session, now: Instant) -> Vec<SessionEvent> {
        let sender = to.address();
        let mut events = Vec::new();
        for packet in from.poll(now) {
            let data = from.encode(&packet).unwrap();
            let decoded = to.decode(&data).unwrap();
            events.extend(to.on_packet(decoded, sender, now));
        }
        events
    }

    #[test]
    fn test_message_crosses_sessions() {
        let now = Instant::now();
        let (mut initiator, mut responder) = pair(now);
        let flow = initiator.open_flow(NET_CONNECTION_SIGNATURE, None, true);
        initiator.send(flow, Bytes::from_static(b"connect"));

        let events = deliver(&mut initiator, &mut responder, now);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Message {
                flow_id,
                signature,
                message,
                ..
            } => {
                assert_eq!(*flow_id, flow);
                assert_eq!(&signature[..], NET_CONNECTION_SIGNATURE);
                assert_eq!(&message[..], b"connect");
            }
            other => panic!("unexpected {:?}", other),
        }

        // the ack empties the writer
        deliver(&mut responder, &mut initiator, now);
        assert!(initiator.poll(now + RETRANSMIT_AFTER).is_empty());
    }

    #[test]
    fn test_flow_exception_closes_writer() {
        let now = Instant::now();
        let (mut initiator, mut responder) = pair(now);
        let flow = initiator.open_flow(NET_CONNECTION_SIGNATURE, None, true);
        initiator.send(flow, Bytes::from_static(b"refused"));
        initiator.poll(now);

        let mut body = BytesMut::new();
        FlowException { flow_id: flow, code: 0 }.encode(&mut body);
        responder.control.push((chunk::EXCEPTION, body.freeze()));
        let events = deliver(&mut responder, &mut initiator, now);
        assert!(matches!(events.as_slice(), [SessionEvent::FlowClosed(id)] if *id == flow));

        // nothing is retransmitted and the flow no longer accepts messages
        assert!(initiator.poll(now + RETRANSMIT_AFTER).is_empty());
        assert!(!initiator.send(flow, Bytes::from_static(b"again")));
    }

    #[test]
    fn test_large_message_spans_packets() {
        let now = Instant::now();
        let (mut initiator, mut responder) = pair(now);
        let flow = initiator.open_flow(NET_CONNECTION_SIGNATURE, None, true);
        let message = Bytes::from(vec![1u8; 5000]);
        initiator.send(flow, message.clone());

        let packets = initiator.poll(now);
        assert!(packets.len() > 1);
        let mut received = Vec::new();
        for packet in packets {
            let data = initiator.encode(&packet).unwrap();
            let decoded = responder.decode(&data).unwrap();
            received.extend(responder.on_packet(decoded, responder.address(), now));
        }
        assert!(matches!(
            received.as_slice(),
            [SessionEvent::Message { message: m, .. }] if *m == message
        ));
    }

    #[test]
    fn test_close_handshake() {
        let now = Instant::now();
        let (mut initiator, mut responder) = pair(now);
        initiator.close(now);
        let events = deliver(&mut initiator, &mut responder, now);
        assert!(matches!(events.as_slice(), [SessionEvent::Closed]));
        let events = deliver(&mut responder, &mut initiator, now);
        assert!(matches!(events.as_slice(), [SessionEvent::Closed]));
        assert_eq!(initiator.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_times_out() {
        let now = Instant::now();
        let (mut initiator, _) = pair(now);
        initiator.close(now);
        assert!(initiator.on_tick(now + Duration::from_secs(1)).is_none());
        assert!(matches!(
            initiator.on_tick(now + CLOSE_TIMEOUT),
            Some(SessionEvent::Closed)
        ));
    }

    #[test]
    fn test_keepalive_and_timeout() {
        let now = Instant::now();
        let (mut initiator, mut responder) = pair(now);
        assert!(initiator.on_tick(now + KEEPALIVE_AFTER).is_none());
        let later = now + KEEPALIVE_AFTER;
        deliver(&mut initiator, &mut responder, later);
        // the responder answers the ping
        let packets = responder.poll(later);
        assert_eq!(packets.len(), 1);

        assert!(matches!(
            initiator.on_tick(now + SESSION_TIMEOUT),
            Some(SessionEvent::Failed(_))
        ));
    }
}
