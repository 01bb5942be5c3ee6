//! Protocol state of one connection handle
//!
//! A [`Link`] owns every session of a handle: the server session, peer
//! sessions opened by `connect2peer`, sessions of peers playing our P2P
//! publication and group neighbors. It does no I/O: the worker feeds it
//! datagrams, commands and clock ticks and sends whatever [`Link::poll`]
//! returns.

use bytes::Bytes;
use rand::Rng;
use rtmfp_core::amf::{self, Amf0Value};
use rtmfp_core::chunk::{self, ChunkReader};
use rtmfp_core::handshake::{Epd, IHello, IIKeying, RHello, RIKeying, Redirect};
use rtmfp_core::message::{Message, MessageType};
use rtmfp_core::{session_id, Direction, Engine, Packet, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::GroupConfig;
use crate::connection::StreamRole;
use crate::driver::{Command, EventSink};
use crate::events::Event;
use crate::flow::{
    parse_stream_signature, stream_signature, GROUP_CONTROL_SIGNATURE, GROUP_MEDIA_SIGNATURE,
    NET_CONNECTION_SIGNATURE,
};
use crate::group::{self, GroupAction, GroupMedia, MAX_NEIGHBORS};
use crate::handle::Handle;
use crate::handshake::{Identity, Initiator, KeyingReply, Responder};
use crate::logging;
use crate::session::{Session, SessionEvent, SessionState};
use crate::url::{publication_and_url, RtmfpUrl};

const CONNECT_TRANSACTION: f64 = 1.0;

const DUMP_NAME: &str = "RTMFP";

/// Encrypted datagram ready to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub address: SocketAddr,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Resolving,
    Handshaking,
    Connected,
    Closing,
    Closed,
}

/// Why a session exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionRole {
    Server,
    /// We play a stream from this peer into `media_id`
    Peer(u16),
    /// Group member we connected to
    Neighbor,
    /// A peer connected to us
    Incoming,
}

#[derive(Debug)]
struct Pending {
    initiator: Initiator,
    role: SessionRole,
}

/// Stream played or published through the server
#[derive(Debug)]
struct ServerStream {
    media_id: u16,
    role: StreamRole,
    name: String,
    stream_id: Option<u32>,
    flow: Option<u64>,
    /// Unreliable flow for media whose reliability flag is off
    lossy_flow: Option<u64>,
    audio_reliable: bool,
    video_reliable: bool,
}

#[derive(Debug)]
struct PeerPlay {
    stream: String,
    session: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subscriber {
    session: u32,
    flow: u64,
}

#[derive(Debug)]
struct Publication {
    media_id: u16,
    name: String,
    role: StreamRole,
}

#[derive(Debug)]
struct Group {
    media_id: u16,
    stream: String,
    media: GroupMedia,
    reliable: bool,
    control_flow: Option<u64>,
    joined_at: Option<Instant>,
    fallback: Option<RtmfpUrl>,
    fallback_started: bool,
    neighbor_flows: HashMap<u32, u64>,
}

/// Connection details taken from the connect command
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: RtmfpUrl,
    pub swf_url: Option<String>,
    pub page_url: Option<String>,
    pub flash_ver: String,
}

/// Sessions, flows and streams of one handle
pub struct Link {
    handle: Handle,
    request: ConnectRequest,
    sink: EventSink,
    identity: Identity,
    handshake_encoder: Engine,
    handshake_decoder: Engine,
    state: LinkState,
    server_address: Option<SocketAddr>,
    local_address: Option<SocketAddr>,
    pending: HashMap<u32, Pending>,
    responder: Responder,
    sessions: HashMap<u32, Session>,
    roles: HashMap<u32, SessionRole>,
    server: Option<u32>,
    nc_flow: Option<u64>,
    queued: Vec<Command>,
    next_transaction: f64,
    requests: HashMap<u64, u16>,
    streams: HashMap<u16, ServerStream>,
    peer_plays: HashMap<u16, PeerPlay>,
    peer_calls: HashMap<u32, u64>,
    publication: Option<Publication>,
    subscribers: Vec<Subscriber>,
    group: Option<Group>,
    fallback_after: Option<Duration>,
    outbox: Vec<Datagram>,
}

fn invocation(command: &amf::Command) -> Option<Bytes> {
    match command.encode() {
        Ok(payload) => Some(Message::invocation(payload).encode()),
        Err(e) => {
            warn!("Unable to encode {}: {}", command.name, e);
            None
        }
    }
}

fn first_string(command: &amf::Command) -> Option<&str> {
    match command.args.first() {
        Some(Amf0Value::Utf8String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn media_of(command: &Command) -> Option<u16> {
    match command {
        Command::ConnectPeer { media_id, .. }
        | Command::ConnectGroup { media_id, .. }
        | Command::AddStream { media_id, .. }
        | Command::Write { media_id, .. } => Some(*media_id),
        _ => None,
    }
}

impl Link {
    pub fn new(
        handle: Handle,
        request: ConnectRequest,
        sink: EventSink,
        fallback_after: Option<Duration>,
    ) -> Self {
        let identity = Identity::generate();
        info!(
            "Connection {} peer id {}",
            handle,
            hex::encode(identity.peer_id())
        );
        Self {
            handle,
            request,
            sink,
            identity,
            handshake_encoder: Engine::handshake(Direction::Encrypt),
            handshake_decoder: Engine::handshake(Direction::Decrypt),
            state: LinkState::Resolving,
            server_address: None,
            local_address: None,
            pending: HashMap::new(),
            responder: Responder::new(),
            sessions: HashMap::new(),
            roles: HashMap::new(),
            server: None,
            nc_flow: None,
            queued: Vec::new(),
            next_transaction: CONNECT_TRANSACTION + 1.0,
            requests: HashMap::new(),
            streams: HashMap::new(),
            peer_plays: HashMap::new(),
            peer_calls: HashMap::new(),
            publication: None,
            subscribers: Vec::new(),
            group: None,
            fallback_after,
            outbox: Vec::new(),
        }
    }

    /// True once nothing is left to send and the handle has been told
    pub fn is_finished(&self) -> bool {
        self.state == LinkState::Closed
    }

    /// Server addresses are known; start the handshake
    pub fn on_resolved(&mut self, addresses: Vec<SocketAddr>, local: SocketAddr) {
        if self.state != LinkState::Resolving {
            return;
        }
        debug!(
            "Connection {} resolved {} to {:?}",
            self.handle,
            self.request.url.host(),
            addresses
        );
        self.local_address = Some(local);
        self.server_address = addresses.first().copied();
        let epd = Epd::Url(self.request.url.as_str().to_string());
        let near_id = self.allocate_id();
        self.pending.insert(
            near_id,
            Pending {
                initiator: Initiator::new(epd, addresses, near_id),
                role: SessionRole::Server,
            },
        );
        self.state = LinkState::Handshaking;
    }

    /// DNS or bind failure
    pub fn on_setup_failed(&mut self, reason: &str) {
        self.fail(reason);
    }

    pub fn on_socket_error(&self, message: &str) {
        self.sink.socket_error(self.handle, message);
    }

    fn fail(&mut self, reason: &str) {
        if self.state == LinkState::Closed {
            return;
        }
        self.sink.fail(self.handle, reason);
        self.state = LinkState::Closed;
        self.pending.clear();
    }

    fn allocate_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u32 = rng.gen();
            if id != 0 && !self.sessions.contains_key(&id) && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn push_handshake(&mut self, address: SocketAddr, far_id: u32, packet: &Packet) {
        logging::dump(DUMP_NAME, &packet.body);
        match packet.encode(far_id, &self.handshake_encoder) {
            Ok(data) => self.outbox.push(Datagram { address, data }),
            Err(e) => debug!("Connection {}: handshake encode failed: {}", self.handle, e),
        }
    }

    // Commands

    pub fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Connect { .. } => {
                debug!("Connection {} is already connecting", self.handle);
            }
            Command::Disconnect { .. } => self.disconnect(now),
            Command::CloseStream { media_id, .. } | Command::ClosePublication { media_id, .. } => {
                self.queued.retain(|queued| media_of(queued) != Some(media_id));
                self.close_media(media_id, now);
            }
            command => match self.state {
                LinkState::Connected => self.execute(command, now),
                LinkState::Resolving | LinkState::Handshaking => {
                    trace!("Connection {} queues {}", self.handle, command.name());
                    self.queued.push(command);
                }
                LinkState::Closing | LinkState::Closed => {
                    debug!("Connection {} is closing, dropping {}", self.handle, command.name());
                }
            },
        }
    }

    fn execute(&mut self, command: Command, now: Instant) {
        match command {
            Command::ConnectPeer {
                media_id,
                peer_id,
                stream,
                ..
            } => self.connect_peer(media_id, peer_id, stream),
            Command::ConnectGroup {
                media_id,
                stream,
                group,
                audio_reliable,
                video_reliable,
                fallback,
                ..
            } => self.connect_group(media_id, stream, group, audio_reliable && video_reliable, fallback),
            Command::AddStream {
                media_id,
                role,
                stream,
                audio_reliable,
                video_reliable,
                ..
            } => self.add_stream(media_id, role, stream, audio_reliable, video_reliable),
            Command::Write { media_id, tag, .. } => {
                if let Some(message) = Message::from_flv_tag(&tag) {
                    self.write(media_id, message, now);
                }
            }
            Command::Call {
                function,
                args,
                peer_id,
                ..
            } => self.call(&function, args, peer_id),
            other => debug!("Connection {}: unexpected {}", self.handle, other.name()),
        }
    }

    fn server_session(&mut self) -> Option<&mut Session> {
        let id = self.server?;
        self.sessions.get_mut(&id)
    }

    fn send_server(&mut self, flow: u64, message: Bytes) {
        if let Some(session) = self.server_session() {
            session.send(flow, message);
        }
    }

    fn next_transaction(&mut self) -> f64 {
        let id = self.next_transaction;
        self.next_transaction += 1.0;
        id
    }

    fn add_stream(
        &mut self,
        media_id: u16,
        role: StreamRole,
        name: String,
        audio_reliable: bool,
        video_reliable: bool,
    ) {
        if role.is_publisher() {
            self.publication = Some(Publication {
                media_id,
                name: name.clone(),
                role,
            });
        }
        if role == StreamRole::P2pPublish {
            info!("Connection {} publishes {} to peers", self.handle, name);
            self.sink.post(self.handle, Event::P2pPublished);
            return;
        }
        self.streams.insert(
            media_id,
            ServerStream {
                media_id,
                role,
                name,
                stream_id: None,
                flow: None,
                lossy_flow: None,
                audio_reliable,
                video_reliable,
            },
        );
        self.create_stream(media_id);
    }

    fn create_stream(&mut self, media_id: u16) {
        let Some(nc_flow) = self.nc_flow else {
            return;
        };
        let transaction = self.next_transaction();
        self.requests.insert(transaction as u64, media_id);
        if let Some(message) = invocation(&amf::Command::new("createStream", transaction)) {
            self.send_server(nc_flow, message);
        }
    }

    fn on_stream_created(&mut self, media_id: u16, stream_id: u32) {
        let nc_flow = self.nc_flow;
        let Some(server) = self.server else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&server) else {
            return;
        };
        let Some(stream) = self.streams.get_mut(&media_id) else {
            // closed while the request was in flight
            if let Some(message) = invocation(
                &amf::Command::new("deleteStream", 0.0).arg(Amf0Value::Number(stream_id as f64)),
            ) {
                if let Some(flow) = nc_flow {
                    session.send(flow, message);
                }
            }
            return;
        };
        debug!(
            "Connection {} stream {} ({}) has id {}",
            self.handle, media_id, stream.name, stream_id
        );
        let flow = session.open_flow(stream_signature(stream_id), nc_flow, true);
        stream.stream_id = Some(stream_id);
        stream.flow = Some(flow);
        if stream.role.is_publisher() && !(stream.audio_reliable && stream.video_reliable) {
            stream.lossy_flow = Some(session.open_flow(stream_signature(stream_id), nc_flow, false));
        }
        let command = if stream.role.is_publisher() {
            amf::Command::new("publish", 0.0)
                .arg(amf::string(stream.name.clone()))
                .arg(amf::string("live"))
        } else {
            amf::Command::new("play", 0.0).arg(amf::string(stream.name.clone()))
        };
        if let Some(message) = invocation(&command) {
            session.send(flow, message);
        }
    }

    fn connect_peer(&mut self, media_id: u16, peer_id: PeerId, stream: String) {
        let Some(server_address) = self.server_address else {
            return;
        };
        info!(
            "Connection {} connecting to peer {} for {}",
            self.handle,
            hex::encode(peer_id),
            stream
        );
        self.peer_plays.insert(
            media_id,
            PeerPlay {
                stream,
                session: None,
            },
        );
        self.start_handshake(Epd::PeerId(peer_id), server_address, SessionRole::Peer(media_id));
    }

    fn start_handshake(&mut self, epd: Epd, address: SocketAddr, role: SessionRole) {
        let near_id = self.allocate_id();
        self.pending.insert(
            near_id,
            Pending {
                initiator: Initiator::new(epd, vec![address], near_id),
                role,
            },
        );
    }

    fn connect_group(
        &mut self,
        media_id: u16,
        stream: String,
        config: GroupConfig,
        reliable: bool,
        fallback: Option<RtmfpUrl>,
    ) {
        let nc_flow = self.nc_flow;
        let join = group::encode_join(&config.net_group);
        let publisher = config.is_publisher;
        info!(
            "Connection {} joining group as {} of {}",
            self.handle,
            if publisher { "publisher" } else { "player" },
            stream
        );
        let control_flow = self.server_session().map(|session| {
            let flow = session.open_flow(GROUP_CONTROL_SIGNATURE, nc_flow, true);
            session.send(flow, join);
            flow
        });
        if publisher {
            self.publication = Some(Publication {
                media_id,
                name: stream.clone(),
                role: StreamRole::GroupPublish,
            });
        }
        self.group = Some(Group {
            media_id,
            stream,
            media: GroupMedia::new(config),
            reliable,
            control_flow,
            joined_at: None,
            fallback,
            fallback_started: false,
            neighbor_flows: HashMap::new(),
        });
    }

    fn write(&mut self, media_id: u16, message: Message, now: Instant) {
        let Some(publication) = self.publication.as_ref() else {
            trace!("Connection {}: no publication for media", self.handle);
            return;
        };
        if publication.media_id != media_id {
            return;
        }
        let role = publication.role;
        let data = message.encode();
        match role {
            StreamRole::P2pPublish => {
                for subscriber in &self.subscribers {
                    if let Some(session) = self.sessions.get_mut(&subscriber.session) {
                        session.send(subscriber.flow, data.clone());
                    }
                }
            }
            StreamRole::GroupPublish => {
                let actions = match self.group.as_mut() {
                    Some(group) => group.media.publish(data, now),
                    None => return,
                };
                self.apply_group_actions(actions);
            }
            _ => {
                let Some(stream) = self.streams.get(&media_id) else {
                    return;
                };
                let reliable = match message.kind {
                    MessageType::Audio => stream.audio_reliable,
                    MessageType::Video => stream.video_reliable,
                    _ => true,
                };
                let flow = if reliable {
                    stream.flow
                } else {
                    stream.lossy_flow.or(stream.flow)
                };
                match flow {
                    Some(flow) => self.send_server(flow, data),
                    None => trace!("Connection {}: stream {} not created yet", self.handle, media_id),
                }
            }
        }
    }

    fn call(&mut self, function: &str, args: Vec<String>, peer_id: Option<PeerId>) {
        let mut command = amf::Command::new(function, 0.0);
        for arg in args {
            command = command.arg(amf::string(arg));
        }
        let Some(message) = invocation(&command) else {
            return;
        };
        match peer_id {
            None => {
                if let Some(flow) = self.nc_flow {
                    self.send_server(flow, message);
                }
            }
            Some(peer_id) => {
                let target = self
                    .sessions
                    .iter()
                    .find(|(_, session)| session.peer_id() == Some(&peer_id) && session.is_open())
                    .map(|(id, _)| *id);
                let Some(near_id) = target else {
                    warn!(
                        "Connection {}: no session with peer {} for {}",
                        self.handle,
                        hex::encode(peer_id),
                        function
                    );
                    return;
                };
                let Some(session) = self.sessions.get_mut(&near_id) else {
                    return;
                };
                let flow = *self
                    .peer_calls
                    .entry(near_id)
                    .or_insert_with(|| session.open_flow(NET_CONNECTION_SIGNATURE, None, true));
                session.send(flow, message);
            }
        }
    }

    fn close_media(&mut self, media_id: u16, now: Instant) {
        if self
            .publication
            .as_ref()
            .is_some_and(|publication| publication.media_id == media_id)
        {
            if let Some(publication) = self.publication.take() {
                debug!("Connection {} unpublishes {}", self.handle, publication.name);
            }
            for subscriber in std::mem::take(&mut self.subscribers) {
                if let Some(session) = self.sessions.get_mut(&subscriber.session) {
                    session.close_flow(subscriber.flow);
                }
            }
        }

        if let Some(stream) = self.streams.remove(&media_id) {
            let nc_flow = self.nc_flow;
            if let Some(session) = self.server_session() {
                if let Some(flow) = stream.flow {
                    if let Some(message) = invocation(&amf::Command::new("closeStream", 0.0)) {
                        session.send(flow, message);
                    }
                    session.close_flow(flow);
                }
                if let Some(flow) = stream.lossy_flow {
                    session.close_flow(flow);
                }
                if let (Some(stream_id), Some(nc_flow)) = (stream.stream_id, nc_flow) {
                    if let Some(message) = invocation(
                        &amf::Command::new("deleteStream", 0.0)
                            .arg(Amf0Value::Number(stream_id as f64)),
                    ) {
                        session.send(nc_flow, message);
                    }
                }
            }
        }

        if let Some(play) = self.peer_plays.remove(&media_id) {
            if let Some(session) = play.session.and_then(|id| self.sessions.get_mut(&id)) {
                session.close(now);
            }
            self.pending
                .retain(|_, pending| pending.role != SessionRole::Peer(media_id));
        }

        if self.group.as_ref().is_some_and(|group| group.media_id == media_id) {
            if let Some(group) = self.group.take() {
                debug!("Connection {} leaves group of {}", self.handle, group.stream);
                if let Some(flow) = group.control_flow {
                    if let Some(session) = self.server_session() {
                        session.close_flow(flow);
                    }
                }
                for neighbor in group.neighbor_flows.keys() {
                    if let Some(session) = self.sessions.get_mut(neighbor) {
                        session.close(now);
                    }
                }
                // a fallback stream shares the group's media id
                self.streams.remove(&media_id);
            }
            self.pending
                .retain(|_, pending| pending.role != SessionRole::Neighbor);
        }
    }

    /// Close every session; [`Event::Closed`] follows once they are gone
    pub fn disconnect(&mut self, now: Instant) {
        if matches!(self.state, LinkState::Closing | LinkState::Closed) {
            return;
        }
        debug!("Connection {} disconnecting", self.handle);
        self.state = LinkState::Closing;
        self.pending.clear();
        self.queued.clear();
        for session in self.sessions.values_mut() {
            session.close(now);
        }
    }

    // Datagrams

    /// Handle one received datagram
    pub fn on_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        if self.state == LinkState::Closed {
            return;
        }
        let near_id = match session_id::unpack(data) {
            Ok(id) => id,
            Err(e) => {
                debug!("Connection {}: dropping datagram from {}: {}", self.handle, from, e);
                return;
            }
        };

        if let Some(session) = self.sessions.get_mut(&near_id) {
            let packet = match session.decode(data) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Connection {}: session {} packet dropped: {}", self.handle, near_id, e);
                    return;
                }
            };
            logging::dump(DUMP_NAME, &packet.body);
            let events = session.on_packet(packet, from, now);
            self.on_session_events(near_id, events, now);
            return;
        }

        let packet = match Packet::decode(data, &self.handshake_decoder) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Connection {}: handshake packet dropped: {}", self.handle, e);
                return;
            }
        };
        logging::dump(DUMP_NAME, &packet.body);
        for item in ChunkReader::new(packet.body) {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("Connection {}: {}", self.handle, e);
                    break;
                }
            };
            let result = match chunk.kind {
                chunk::RHELLO => RHello::decode(chunk.body).map(|rhello| self.on_rhello(from, &rhello, now)),
                chunk::REDIRECT => Redirect::decode(chunk.body).map(|redirect| self.on_redirect(&redirect)),
                chunk::RIKEYING => {
                    RIKeying::decode(chunk.body).map(|rikeying| self.on_rikeying(near_id, &rikeying, now))
                }
                chunk::IHELLO => IHello::decode(chunk.body).map(|hello| self.on_ihello(from, &hello, now)),
                chunk::IIKEYING => {
                    IIKeying::decode(chunk.body).map(|keying| self.on_iikeying(from, &keying, now))
                }
                other => {
                    trace!("Connection {}: ignoring handshake chunk 0x{:02x}", self.handle, other);
                    Ok(())
                }
            };
            if let Err(e) = result {
                debug!("Connection {}: bad handshake chunk: {}", self.handle, e);
            }
        }
    }

    fn on_rhello(&mut self, from: SocketAddr, rhello: &RHello, now: Instant) {
        let identity = &self.identity;
        let reply = self
            .pending
            .values_mut()
            .find(|pending| pending.initiator.tag() == &rhello.tag)
            .and_then(|pending| pending.initiator.on_rhello(from, rhello, identity, now));
        if let Some((address, packet)) = reply {
            self.push_handshake(address, 0, &packet);
        }
    }

    fn on_redirect(&mut self, redirect: &Redirect) {
        let hellos = self
            .pending
            .values_mut()
            .find(|pending| pending.initiator.tag() == &redirect.tag)
            .map(|pending| pending.initiator.on_redirect(redirect))
            .unwrap_or_default();
        for (address, packet) in hellos {
            self.push_handshake(address, 0, &packet);
        }
    }

    fn on_rikeying(&mut self, near_id: u32, rikeying: &RIKeying, now: Instant) {
        let Some(pending) = self.pending.remove(&near_id) else {
            trace!("Connection {}: keying for unknown session {}", self.handle, near_id);
            return;
        };
        let (address, keys) = match pending.initiator.on_rikeying(rikeying) {
            Ok(result) => result,
            Err(e) => {
                debug!("Connection {}: keying rejected: {}", self.handle, e);
                self.pending.insert(near_id, pending);
                return;
            }
        };
        let mut session = Session::new(
            near_id,
            rikeying.responder_session_id,
            address,
            &keys,
            true,
            now,
        );
        if let Epd::PeerId(peer_id) = pending.initiator.epd() {
            session = session.with_peer_id(*peer_id);
        }
        debug!(
            "Connection {} session {} open to {} as {:?}",
            self.handle, near_id, address, pending.role
        );
        self.sessions.insert(near_id, session);
        self.roles.insert(near_id, pending.role);
        self.on_session_opened(near_id, pending.role, now);
    }

    fn accepts_peers(&self) -> bool {
        let publishing = self
            .publication
            .as_ref()
            .is_some_and(|publication| publication.role == StreamRole::P2pPublish);
        publishing || self.group.is_some()
    }

    fn on_ihello(&mut self, from: SocketAddr, hello: &IHello, now: Instant) {
        match &hello.epd {
            Epd::PeerId(peer_id) if peer_id == self.identity.peer_id() && self.accepts_peers() => {
                let packet = self.responder.on_hello(&hello.tag, &self.identity, now);
                self.push_handshake(from, 0, &packet);
            }
            _ => trace!("Connection {}: ignoring hello from {}", self.handle, from),
        }
    }

    fn on_iikeying(&mut self, from: SocketAddr, keying: &IIKeying, now: Instant) {
        let near_id = self.allocate_id();
        match self.responder.on_keying(keying, near_id) {
            Ok(KeyingReply::New {
                packet,
                far_id,
                keys,
                peer_id,
            }) => {
                debug!(
                    "Connection {} accepted peer {} from {}",
                    self.handle,
                    hex::encode(peer_id),
                    from
                );
                let session = Session::new(near_id, far_id, from, &keys, false, now).with_peer_id(peer_id);
                self.sessions.insert(near_id, session);
                self.roles.insert(near_id, SessionRole::Incoming);
                self.push_handshake(from, far_id, &packet);
            }
            Ok(KeyingReply::Repeat { packet, far_id }) => self.push_handshake(from, far_id, &packet),
            Err(e) => debug!("Connection {}: keying from {} refused: {}", self.handle, from, e),
        }
    }

    fn on_session_opened(&mut self, near_id: u32, role: SessionRole, now: Instant) {
        match role {
            SessionRole::Server => {
                self.server = Some(near_id);
                self.send_connect(near_id);
            }
            SessionRole::Peer(media_id) => {
                let Some(play) = self.peer_plays.get_mut(&media_id) else {
                    if let Some(session) = self.sessions.get_mut(&near_id) {
                        session.close(now);
                    }
                    return;
                };
                play.session = Some(near_id);
                let command = amf::Command::new("play", 0.0).arg(amf::string(play.stream.clone()));
                if let (Some(session), Some(message)) = (self.sessions.get_mut(&near_id), invocation(&command)) {
                    let flow = session.open_flow(stream_signature(media_id as u32), None, true);
                    session.send(flow, message);
                }
            }
            SessionRole::Neighbor => self.add_neighbor(near_id),
            SessionRole::Incoming => {}
        }
    }

    fn send_connect(&mut self, near_id: u32) {
        let request = &self.request;
        let object = amf::object([
            ("app", amf::string(request.url.app())),
            ("flashVer", amf::string(request.flash_ver.clone())),
            (
                "swfUrl",
                amf::string(request.swf_url.clone().unwrap_or_default()),
            ),
            ("tcUrl", amf::string(request.url.as_str())),
            ("fpad", Amf0Value::Boolean(false)),
            ("capabilities", Amf0Value::Number(235.0)),
            ("audioCodecs", Amf0Value::Number(3575.0)),
            ("videoCodecs", Amf0Value::Number(252.0)),
            ("videoFunction", Amf0Value::Number(1.0)),
            (
                "pageUrl",
                amf::string(request.page_url.clone().unwrap_or_default()),
            ),
            ("objectEncoding", Amf0Value::Number(0.0)),
        ]);
        let command = amf::Command::new("connect", CONNECT_TRANSACTION).with_object(object);
        let Some(message) = invocation(&command) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&near_id) {
            let flow = session.open_flow(NET_CONNECTION_SIGNATURE, None, true);
            session.send(flow, message);
            self.nc_flow = Some(flow);
        }
    }

    fn on_connected(&mut self, now: Instant) {
        if self.state != LinkState::Handshaking {
            return;
        }
        info!("Connection {} connected to {}", self.handle, self.request.url);
        self.state = LinkState::Connected;
        self.sink.post(self.handle, Event::Connected);

        let mut command = amf::Command::new("setPeerInfo", 0.0);
        if let Some(local) = self.local_address.filter(|address| !address.ip().is_unspecified()) {
            command = command.arg(amf::string(local.to_string()));
        }
        if let (Some(flow), Some(message)) = (self.nc_flow, invocation(&command)) {
            self.send_server(flow, message);
        }

        for queued in std::mem::take(&mut self.queued) {
            self.execute(queued, now);
        }
    }

    // Session events

    fn on_session_events(&mut self, near_id: u32, events: Vec<SessionEvent>, now: Instant) {
        for event in events {
            match event {
                SessionEvent::Message {
                    flow_id,
                    signature,
                    message,
                    ..
                } => self.on_message(near_id, flow_id, &signature, message, now),
                SessionEvent::ForwardedHello(hello) => {
                    if hello.peer_id == *self.identity.peer_id() && self.accepts_peers() {
                        debug!(
                            "Connection {}: hello from {} forwarded by server",
                            self.handle, hello.address
                        );
                        let packet = self.responder.on_hello(&hello.tag, &self.identity, now);
                        self.push_handshake(hello.address, 0, &packet);
                    }
                }
                SessionEvent::FlowClosed(flow_id) => {
                    self.subscribers
                        .retain(|subscriber| !(subscriber.session == near_id && subscriber.flow == flow_id));
                }
                SessionEvent::Closed => debug!("Connection {} session {} closed", self.handle, near_id),
                SessionEvent::Failed(reason) => self.on_session_failed(near_id, &reason),
            }
        }
    }

    fn on_session_failed(&mut self, near_id: u32, reason: &str) {
        match self.roles.get(&near_id) {
            Some(SessionRole::Server) => self.fail(reason),
            Some(SessionRole::Peer(media_id)) => {
                warn!("Connection {} peer stream {} lost: {}", self.handle, media_id, reason);
                self.sink.status(self.handle, "NetStream.Connect.Failed", reason);
            }
            _ => debug!("Connection {} session {} lost: {}", self.handle, near_id, reason),
        }
    }

    fn on_message(&mut self, near_id: u32, flow_id: u64, signature: &[u8], message: Bytes, now: Instant) {
        let Some(role) = self.roles.get(&near_id).copied() else {
            return;
        };
        if signature == GROUP_MEDIA_SIGNATURE {
            self.on_group_media(near_id, message, now);
            return;
        }
        if signature == GROUP_CONTROL_SIGNATURE {
            if role == SessionRole::Server {
                self.on_group_control(&message, now);
            }
            return;
        }
        let Some(stream_id) = parse_stream_signature(signature) else {
            trace!("Connection {}: unknown flow signature {:02x?}", self.handle, signature);
            return;
        };
        let message = match Message::decode(message) {
            Ok(message) => message,
            Err(e) => {
                debug!("Connection {}: bad message: {}", self.handle, e);
                return;
            }
        };
        match role {
            SessionRole::Server => self.on_server_message(stream_id, message, now),
            SessionRole::Peer(media_id) => self.on_peer_message(media_id, message),
            SessionRole::Neighbor | SessionRole::Incoming => {
                self.on_incoming_message(near_id, flow_id, stream_id, message)
            }
        }
    }

    fn decode_invocation(&self, message: &Message) -> Option<amf::Command> {
        match amf::Command::decode(&message.payload) {
            Ok(command) => Some(command),
            Err(e) => {
                debug!("Connection {}: bad invocation: {}", self.handle, e);
                None
            }
        }
    }

    fn on_server_message(&mut self, stream_id: u32, message: Message, now: Instant) {
        match message.kind {
            MessageType::Invocation => {
                if let Some(command) = self.decode_invocation(&message) {
                    self.on_server_invocation(stream_id, command, now);
                }
            }
            MessageType::Raw => trace!("Connection {}: stream {} control", self.handle, stream_id),
            _ => {
                let media_id = self
                    .streams
                    .values()
                    .find(|stream| stream.stream_id == Some(stream_id))
                    .map(|stream| stream.media_id);
                if let (Some(media_id), Some(tag)) = (media_id, message.to_flv_tag()) {
                    self.sink.media(self.handle, media_id, &tag);
                }
            }
        }
    }

    fn on_server_invocation(&mut self, stream_id: u32, command: amf::Command, now: Instant) {
        let status = amf::status(command.info());
        match command.name.as_str() {
            "_result" if command.transaction_id == CONNECT_TRANSACTION => {
                let (code, description) = status.unwrap_or_default();
                self.sink.status(self.handle, &code, &description);
                if code == "NetConnection.Connect.Success" {
                    self.on_connected(now);
                } else {
                    self.fail(&format!("connect answered {}", code));
                }
            }
            "_error" if command.transaction_id == CONNECT_TRANSACTION => {
                let (code, description) = status.unwrap_or_default();
                self.sink.status(self.handle, &code, &description);
                self.fail(&format!("connect refused: {} {}", code, description));
            }
            "_result" => {
                let Some(media_id) = self.requests.remove(&(command.transaction_id as u64)) else {
                    return;
                };
                match command.args.first() {
                    Some(Amf0Value::Number(id)) => self.on_stream_created(media_id, *id as u32),
                    other => warn!("Connection {}: createStream answered {:?}", self.handle, other),
                }
            }
            "_error" => {
                self.requests.remove(&(command.transaction_id as u64));
                let (code, description) = status.unwrap_or_default();
                warn!("Connection {} request failed: {} {}", self.handle, code, description);
                self.sink.status(self.handle, &code, &description);
            }
            "onStatus" => {
                let Some((code, description)) = status else {
                    return;
                };
                self.sink.status(self.handle, &code, &description);
                if code == "NetStream.Publish.Start"
                    && self
                        .streams
                        .values()
                        .any(|stream| stream.stream_id == Some(stream_id) && stream.role.is_publisher())
                {
                    self.sink.post(self.handle, Event::Published);
                }
            }
            other => debug!("Connection {}: server invoked {}", self.handle, other),
        }
    }

    fn on_peer_message(&mut self, media_id: u16, message: Message) {
        match message.kind {
            MessageType::Invocation => {
                let Some(command) = self.decode_invocation(&message) else {
                    return;
                };
                if command.name != "onStatus" {
                    debug!("Connection {}: peer invoked {}", self.handle, command.name);
                    return;
                }
                if let Some((code, description)) = amf::status(command.info()) {
                    self.sink.status(self.handle, &code, &description);
                    if code == "NetStream.Play.Start" {
                        self.sink.post(self.handle, Event::PeerConnected);
                    }
                }
            }
            MessageType::Raw => {}
            _ => {
                if let Some(tag) = message.to_flv_tag() {
                    self.sink.media(self.handle, media_id, &tag);
                }
            }
        }
    }

    fn on_incoming_message(&mut self, near_id: u32, flow_id: u64, stream_id: u32, message: Message) {
        if message.kind != MessageType::Invocation {
            return;
        }
        let Some(command) = self.decode_invocation(&message) else {
            return;
        };
        if command.name != "play" {
            info!("Connection {}: peer invoked {}", self.handle, command.name);
            return;
        }
        let name = first_string(&command).unwrap_or_default().to_string();
        let accepted = self.publication.as_ref().is_some_and(|publication| {
            publication.role == StreamRole::P2pPublish && publication.name == name
        });
        let Some(session) = self.sessions.get_mut(&near_id) else {
            return;
        };
        let flow = session.open_flow(stream_signature(stream_id), Some(flow_id), true);
        let status = if accepted {
            amf::status_object("status", "NetStream.Play.Start", &format!("Started playing {}", name))
        } else {
            amf::status_object(
                "error",
                "NetStream.Play.StreamNotFound",
                &format!("{} is not published", name),
            )
        };
        if let Some(reply) = invocation(&amf::Command::new("onStatus", 0.0).arg(status)) {
            session.send(flow, reply);
        }
        if accepted {
            info!("Connection {}: peer session {} plays {}", self.handle, near_id, name);
            self.subscribers.push(Subscriber {
                session: near_id,
                flow,
            });
        } else {
            session.close_flow(flow);
        }
    }

    // Group

    fn on_group_control(&mut self, message: &[u8], now: Instant) {
        let Some(peers) = group::decode_peer_list(message) else {
            trace!("Connection {}: unknown group control message", self.handle);
            return;
        };
        let Some(server_address) = self.server_address else {
            return;
        };
        let own = *self.identity.peer_id();
        let Some(group) = self.group.as_mut() else {
            return;
        };
        if group.joined_at.is_none() {
            group.joined_at = Some(now);
            info!(
                "Connection {} joined group with {} members",
                self.handle,
                peers.len()
            );
            self.sink.post(self.handle, Event::GroupConnected);
        }
        let connecting = self
            .pending
            .values()
            .filter(|pending| pending.role == SessionRole::Neighbor)
            .count();
        let room = MAX_NEIGHBORS.saturating_sub(group.neighbor_flows.len() + connecting);
        let known: Vec<PeerId> = self.sessions.values().filter_map(|s| s.peer_id().copied()).collect();
        let candidates: Vec<PeerId> = peers
            .into_iter()
            .filter(|peer| *peer != own && !known.contains(peer))
            .take(room)
            .collect();
        for peer in candidates {
            self.start_handshake(Epd::PeerId(peer), server_address, SessionRole::Neighbor);
        }
    }

    fn add_neighbor(&mut self, near_id: u32) {
        let Some(group) = self.group.as_mut() else {
            return;
        };
        if group.neighbor_flows.contains_key(&near_id) {
            return;
        }
        let Some(session) = self.sessions.get_mut(&near_id) else {
            return;
        };
        let flow = session.open_flow(GROUP_MEDIA_SIGNATURE, None, group.reliable);
        group.neighbor_flows.insert(near_id, flow);
        debug!("Connection {}: group neighbor {}", self.handle, near_id);
        let actions = group.media.add_neighbor(near_id);
        self.apply_group_actions(actions);
    }

    fn on_group_media(&mut self, near_id: u32, message: Bytes, now: Instant) {
        if self.group.is_none() {
            return;
        }
        self.add_neighbor(near_id);
        let actions = match self.group.as_mut() {
            Some(group) => group.media.on_message(near_id, message, now),
            None => return,
        };
        self.apply_group_actions(actions);
    }

    fn apply_group_actions(&mut self, actions: Vec<GroupAction>) {
        let Some(group) = self.group.as_ref() else {
            return;
        };
        for action in actions {
            match action {
                GroupAction::Send { neighbor, message } => {
                    let flow = group.neighbor_flows.get(&neighbor).copied();
                    if let (Some(flow), Some(session)) = (flow, self.sessions.get_mut(&neighbor)) {
                        session.send(flow, message);
                    }
                }
                GroupAction::Deliver(data) => match Message::decode(data) {
                    Ok(message) => {
                        if let Some(tag) = message.to_flv_tag() {
                            self.sink.media(self.handle, group.media_id, &tag);
                        }
                    }
                    Err(e) => debug!("Connection {}: bad group media: {}", self.handle, e),
                },
            }
        }
    }

    fn check_fallback(&mut self, now: Instant) {
        let Some(after) = self.fallback_after else {
            return;
        };
        let Some(group) = self.group.as_mut() else {
            return;
        };
        if group.fallback_started || group.media.config().is_publisher {
            return;
        }
        let Some(since) = group.media.last_media().or(group.joined_at) else {
            return;
        };
        if now.duration_since(since) < after {
            return;
        }
        let Some(fallback) = group.fallback.as_ref() else {
            return;
        };
        let Some((_, name)) = publication_and_url(fallback.as_str()) else {
            return;
        };
        group.fallback_started = true;
        let media_id = group.media_id;
        info!(
            "Connection {}: no group media for {}s, playing {}",
            self.handle,
            after.as_secs(),
            name
        );
        self.add_stream(media_id, StreamRole::Play, name, true, true);
    }

    // Output

    /// Advance timers and collect every datagram due at `now`
    pub fn poll(&mut self, now: Instant) -> Vec<Datagram> {
        if self.state != LinkState::Closed {
            self.poll_handshakes(now);
            self.responder.expire(now);

            let ids: Vec<u32> = self.sessions.keys().copied().collect();
            for id in ids {
                let event = self.sessions.get_mut(&id).and_then(|session| session.on_tick(now));
                if let Some(SessionEvent::Failed(reason)) = event {
                    self.on_session_failed(id, &reason);
                }
            }

            let actions = self
                .group
                .as_mut()
                .map(|group| group.media.tick(now))
                .unwrap_or_default();
            self.apply_group_actions(actions);
            self.check_fallback(now);
        }

        for session in self.sessions.values_mut() {
            for packet in session.poll(now) {
                logging::dump(DUMP_NAME, &packet.body);
                match session.encode(&packet) {
                    Ok(data) => self.outbox.push(Datagram {
                        address: session.address(),
                        data,
                    }),
                    Err(e) => debug!("Connection {}: encode failed: {}", self.handle, e),
                }
            }
        }
        self.reap_sessions(now);

        if self.state == LinkState::Closing && self.sessions.is_empty() {
            info!("Connection {} closed", self.handle);
            self.state = LinkState::Closed;
            self.sink.closed(self.handle);
        }
        std::mem::take(&mut self.outbox)
    }

    fn poll_handshakes(&mut self, now: Instant) {
        let mut failed = Vec::new();
        let mut out = Vec::new();
        for (near_id, pending) in self.pending.iter_mut() {
            match pending.initiator.poll(now) {
                Ok(packets) => out.extend(packets),
                Err(e) => failed.push((*near_id, e.to_string())),
            }
        }
        for (address, packet) in out {
            self.push_handshake(address, 0, &packet);
        }
        for (near_id, reason) in failed {
            let Some(pending) = self.pending.remove(&near_id) else {
                continue;
            };
            match pending.role {
                SessionRole::Server | SessionRole::Peer(_) => self.fail(&reason),
                _ => debug!("Connection {}: neighbor handshake failed: {}", self.handle, reason),
            }
        }
    }

    fn reap_sessions(&mut self, now: Instant) {
        let closed: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state() == SessionState::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.sessions.remove(&id);
            self.peer_calls.remove(&id);
            self.subscribers.retain(|subscriber| subscriber.session != id);
            if let Some(group) = self.group.as_mut() {
                if group.neighbor_flows.remove(&id).is_some() {
                    group.media.remove_neighbor(id);
                }
            }
            if self.roles.remove(&id) == Some(SessionRole::Server) && self.state != LinkState::Closing {
                self.server = None;
                self.nc_flow = None;
                if self.state != LinkState::Closed {
                    self.sink
                        .status(self.handle, "NetConnection.Connect.Closed", "server closed the session");
                    self.disconnect(now);
                }
            }
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("sessions", &self.sessions.len())
            .field("pending", &self.pending.len())
            .field("streams", &self.streams.len())
            .finish()
    }
}
