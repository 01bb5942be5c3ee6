//! Handshake state machines for both sides of a session

use bytes::Bytes;
use rand::RngCore;
use rtmfp_core::chunk::{self, ChunkWriter};
use rtmfp_core::dh::DiffieHellman;
use rtmfp_core::handshake::{self, Epd, IHello, IIKeying, RHello, RIKeying, Redirect, Tag};
use rtmfp_core::{compute_asymmetric_keys, Marker, Packet, PeerId, SessionKeys};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Delay between hello or keying retransmissions
pub const HELLO_RETRY: Duration = Duration::from_millis(1500);

/// Attempts before the handshake is abandoned
pub const HELLO_ATTEMPTS: u32 = 5;

const COOKIE_SIZE: usize = 64;

/// Unused cookies are forgotten after this long
const COOKIE_LIFETIME: Duration = Duration::from_secs(95);

/// Wrap one handshake chunk in a packet
pub fn handshake_packet(kind: u8, body: &[u8]) -> Packet {
    let mut writer = ChunkWriter::new(Packet::capacity(false));
    writer.push(kind, body);
    Packet::new(Marker::HANDSHAKE, writer.into_bytes())
}

/// Certificate and peer ID of the local endpoint
#[derive(Debug, Clone)]
pub struct Identity {
    certificate: Bytes,
    peer_id: PeerId,
}

impl Identity {
    pub fn generate() -> Self {
        let certificate = handshake::generate_certificate();
        let peer_id = handshake::peer_id(&certificate);
        Self {
            certificate,
            peer_id,
        }
    }

    pub fn certificate(&self) -> &Bytes {
        &self.certificate
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

#[derive(Debug)]
enum Stage {
    Hello,
    Keying { address: SocketAddr, packet: Packet },
}

/// Initiating side: IHello until RHello, then IIKeying until RIKeying
#[derive(Debug)]
pub struct Initiator {
    epd: Epd,
    tag: Tag,
    near_id: u32,
    candidates: Vec<SocketAddr>,
    attempts: u32,
    last_sent: Option<Instant>,
    dh: DiffieHellman,
    skic: Bytes,
    stage: Stage,
}

impl Initiator {
    pub fn new(epd: Epd, candidates: Vec<SocketAddr>, near_id: u32) -> Self {
        let dh = DiffieHellman::generate();
        let skic = handshake::key_component(dh.public_key());
        Self {
            epd,
            tag: handshake::random_tag(),
            near_id,
            candidates,
            attempts: 0,
            last_sent: None,
            dh,
            skic,
            stage: Stage::Hello,
        }
    }

    pub fn epd(&self) -> &Epd {
        &self.epd
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn is_keying(&self) -> bool {
        matches!(self.stage, Stage::Keying { .. })
    }

    fn hello(&self) -> Packet {
        let body = IHello {
            epd: self.epd.clone(),
            tag: self.tag,
        }
        .encode();
        handshake_packet(chunk::IHELLO, &body)
    }

    /// Packets due at `now`; fails once every attempt went unanswered
    pub fn poll(&mut self, now: Instant) -> Result<Vec<(SocketAddr, Packet)>> {
        if let Some(sent) = self.last_sent {
            if now.duration_since(sent) < HELLO_RETRY {
                return Ok(Vec::new());
            }
        }
        if self.attempts >= HELLO_ATTEMPTS {
            return Err(ClientError::ConnectionFailed(format!(
                "no answer after {} attempts",
                self.attempts
            )));
        }
        self.attempts += 1;
        self.last_sent = Some(now);
        Ok(match &self.stage {
            Stage::Hello => {
                let hello = self.hello();
                self.candidates
                    .iter()
                    .map(|address| (*address, hello.clone()))
                    .collect()
            }
            Stage::Keying { address, packet } => vec![(*address, packet.clone())],
        })
    }

    /// Add the candidates of a redirection; returns hellos for the new ones
    pub fn on_redirect(&mut self, redirect: &Redirect) -> Vec<(SocketAddr, Packet)> {
        if redirect.tag != self.tag || self.is_keying() {
            return Vec::new();
        }
        let hello = self.hello();
        let mut out = Vec::new();
        for (address, kind) in &redirect.addresses {
            if !self.candidates.contains(address) {
                debug!("Handshake {}: candidate {} ({})", self.near_id, address, kind);
                self.candidates.push(*address);
                out.push((*address, hello.clone()));
            }
        }
        out
    }

    /// Answer an RHello with our keying
    pub fn on_rhello(
        &mut self,
        from: SocketAddr,
        rhello: &RHello,
        identity: &Identity,
        now: Instant,
    ) -> Option<(SocketAddr, Packet)> {
        if rhello.tag != self.tag || self.is_keying() {
            return None;
        }
        let body = IIKeying {
            initiator_session_id: self.near_id,
            cookie: rhello.cookie.clone(),
            certificate: identity.certificate().clone(),
            skic: self.skic.clone(),
        }
        .encode();
        let packet = handshake_packet(chunk::IIKEYING, &body);
        self.stage = Stage::Keying {
            address: from,
            packet: packet.clone(),
        };
        self.attempts = 1;
        self.last_sent = Some(now);
        Some((from, packet))
    }

    /// Derive the session keys from the responder's keying
    pub fn on_rikeying(&self, rikeying: &RIKeying) -> Result<(SocketAddr, SessionKeys)> {
        let Stage::Keying { address, .. } = &self.stage else {
            return Err(ClientError::ConnectionFailed(
                "keying answer before hello answer".to_string(),
            ));
        };
        let far_public = handshake::parse_key_component(&rikeying.skrc)?;
        let secret = self.dh.compute_secret(&far_public)?;
        let keys = compute_asymmetric_keys(&secret, &self.skic, &rikeying.skrc);
        Ok((*address, keys))
    }
}

#[derive(Debug)]
struct Cookie {
    created: Instant,
    answer: Option<Packet>,
}

/// Result of an IIKeying addressed to us
#[derive(Debug)]
pub enum KeyingReply {
    /// A new session: send `packet` to `far_id` and open the session
    New {
        packet: Packet,
        far_id: u32,
        keys: SessionKeys,
        peer_id: PeerId,
    },
    /// Retransmitted keying; resend the previous answer
    Repeat { packet: Packet, far_id: u32 },
}

/// Responding side: cookies for hellos, keys for keyings
#[derive(Debug, Default)]
pub struct Responder {
    cookies: HashMap<Bytes, Cookie>,
}

impl Responder {
    pub fn new() -> Self {
        Self::default()
    }

    /// RHello answering a hello with `tag`
    pub fn on_hello(&mut self, tag: &Tag, identity: &Identity, now: Instant) -> Packet {
        let mut cookie = vec![0u8; COOKIE_SIZE];
        rand::thread_rng().fill_bytes(&mut cookie);
        let cookie = Bytes::from(cookie);
        self.cookies.insert(
            cookie.clone(),
            Cookie {
                created: now,
                answer: None,
            },
        );
        let body = RHello {
            tag: *tag,
            cookie,
            certificate: identity.certificate().clone(),
        }
        .encode();
        handshake_packet(chunk::RHELLO, &body)
    }

    /// Validate the cookie and compute the session keys
    pub fn on_keying(&mut self, keying: &IIKeying, near_id: u32) -> Result<KeyingReply> {
        let cookie = self
            .cookies
            .get_mut(&keying.cookie)
            .ok_or_else(|| ClientError::ConnectionFailed("unknown cookie".to_string()))?;
        if let Some(packet) = &cookie.answer {
            return Ok(KeyingReply::Repeat {
                packet: packet.clone(),
                far_id: keying.initiator_session_id,
            });
        }

        let far_public = handshake::parse_key_component(&keying.skic)?;
        let dh = DiffieHellman::generate();
        let secret = dh.compute_secret(&far_public)?;
        let skrc = handshake::key_component(dh.public_key());
        let keys = compute_asymmetric_keys(&secret, &keying.skic, &skrc);

        let body = RIKeying {
            responder_session_id: near_id,
            skrc,
        }
        .encode();
        let packet = handshake_packet(chunk::RIKEYING, &body);
        cookie.answer = Some(packet.clone());
        Ok(KeyingReply::New {
            packet,
            far_id: keying.initiator_session_id,
            keys,
            peer_id: handshake::peer_id(&keying.certificate),
        })
    }

    /// Forget old cookies
    pub fn expire(&mut self, now: Instant) {
        self.cookies
            .retain(|_, cookie| now.duration_since(cookie.created) < COOKIE_LIFETIME);
    }
}
