//! Handshake chunk bodies
//!
//! ```text
//! initiator                         responder
//!   IHello(epd, tag)          ───►
//!                             ◄───  RHello(tag, cookie, certificate)
//!                                   or Redirect(tag, addresses)
//!   IIKeying(sid, cookie,
//!            certificate, skic) ───►
//!                             ◄───  RIKeying(sid, skrc)
//! ```
//!
//! A server relays an IHello addressed to a peer ID as a forwarded hello.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::address::{self, AddressType};
use crate::dh::DH_GROUP_ID;
use crate::error::ensure;
use crate::{chunk, vlu, Error, PeerId, Result, PEER_ID_SIZE};

/// Size of the tag echoed between IHello and RHello
pub const TAG_SIZE: usize = 16;

/// Trailing signature byte of the keying chunks
pub const KEYING_SIGNATURE: u8 = 0x58;

pub type Tag = [u8; TAG_SIZE];

/// Random handshake tag
pub fn random_tag() -> Tag {
    let mut tag = [0u8; TAG_SIZE];
    rand::thread_rng().fill_bytes(&mut tag);
    tag
}

/// Endpoint discriminator carried by IHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Epd {
    /// Server URL
    Url(String),
    /// Peer ID of the target peer
    PeerId(PeerId),
}

impl Epd {
    const URL: u8 = 0x0A;
    const PEER_ID: u8 = 0x0F;

    fn kind(&self) -> u8 {
        match self {
            Epd::Url(_) => Self::URL,
            Epd::PeerId(_) => Self::PEER_ID,
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            Epd::Url(url) => url.as_bytes(),
            Epd::PeerId(id) => id,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        let value = self.value();
        let inner = 1 + value.len();
        vlu::write(buf, (vlu::encoded_len(inner as u64) + inner) as u64);
        vlu::write(buf, inner as u64);
        buf.put_u8(self.kind());
        buf.put_slice(value);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _total = vlu::read(buf)?;
        let inner = vlu::read(buf)? as usize;
        ensure(buf.len(), inner)?;
        if inner == 0 {
            return Err(Error::chunk(chunk::IHELLO, "empty endpoint discriminator"));
        }
        let kind = buf.get_u8();
        let value = buf.split_to(inner - 1);
        match kind {
            Self::URL => Ok(Epd::Url(String::from_utf8_lossy(&value).into_owned())),
            Self::PEER_ID => {
                let id: PeerId = value
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::chunk(chunk::IHELLO, "peer id must be 32 bytes"))?;
                Ok(Epd::PeerId(id))
            }
            other => Err(Error::chunk(
                chunk::IHELLO,
                format!("unknown endpoint discriminator 0x{:02x}", other),
            )),
        }
    }
}

fn read_tag(buf: &mut Bytes) -> Result<Tag> {
    ensure(buf.len(), TAG_SIZE)?;
    let mut tag = [0u8; TAG_SIZE];
    buf.copy_to_slice(&mut tag);
    Ok(tag)
}

fn read_sized_tag(buf: &mut Bytes, kind: u8) -> Result<Tag> {
    let len = vlu::read(buf)? as usize;
    if len != TAG_SIZE {
        return Err(Error::chunk(kind, format!("tag of {} bytes", len)));
    }
    read_tag(buf)
}

/// Initiator hello (chunk 0x30)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHello {
    pub epd: Epd,
    pub tag: Tag,
}

impl IHello {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.epd.encode(&mut buf);
        buf.put_slice(&self.tag);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let epd = Epd::decode(&mut body)?;
        let tag = read_tag(&mut body)?;
        Ok(Self { epd, tag })
    }
}

/// Responder hello (chunk 0x70)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RHello {
    pub tag: Tag,
    pub cookie: Bytes,
    pub certificate: Bytes,
}

impl RHello {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        vlu::write_bytes(&mut buf, &self.tag);
        vlu::write_bytes(&mut buf, &self.cookie);
        buf.put_slice(&self.certificate);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let tag = read_sized_tag(&mut body, chunk::RHELLO)?;
        let cookie = vlu::read_bytes(&mut body)?;
        Ok(Self {
            tag,
            cookie,
            certificate: body,
        })
    }
}

/// Server redirection listing candidate addresses (chunk 0x71)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub tag: Tag,
    pub addresses: Vec<(SocketAddr, AddressType)>,
}

impl Redirect {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        vlu::write_bytes(&mut buf, &self.tag);
        for (addr, kind) in &self.addresses {
            address::write_address(&mut buf, addr, *kind);
        }
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let tag = read_sized_tag(&mut body, chunk::REDIRECT)?;
        let addresses = address::read_addresses(&mut body)?;
        Ok(Self { tag, addresses })
    }
}

/// IHello relayed by a server to the peer it targets (chunk 0x0F)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedHello {
    pub peer_id: PeerId,
    /// Address of the initiating peer
    pub address: SocketAddr,
    pub address_type: AddressType,
    pub tag: Tag,
}

impl ForwardedHello {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        Epd::PeerId(self.peer_id).encode(&mut buf);
        address::write_address(&mut buf, &self.address, self.address_type);
        buf.put_slice(&self.tag);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let peer_id = match Epd::decode(&mut body)? {
            Epd::PeerId(id) => id,
            Epd::Url(_) => {
                return Err(Error::chunk(chunk::FORWARDED_HELLO, "expected a peer id"));
            }
        };
        let (address, address_type) = address::read_address(&mut body)?;
        let tag = read_tag(&mut body)?;
        Ok(Self {
            peer_id,
            address,
            address_type,
            tag,
        })
    }
}

/// Initiator keying (chunk 0x38)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IIKeying {
    pub initiator_session_id: u32,
    pub cookie: Bytes,
    pub certificate: Bytes,
    /// Initiator session key component
    pub skic: Bytes,
}

impl IIKeying {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.initiator_session_id);
        vlu::write_bytes(&mut buf, &self.cookie);
        vlu::write_bytes(&mut buf, &self.certificate);
        vlu::write_bytes(&mut buf, &self.skic);
        buf.put_u8(KEYING_SIGNATURE);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        ensure(body.len(), 4)?;
        let initiator_session_id = body.get_u32();
        let cookie = vlu::read_bytes(&mut body)?;
        let certificate = vlu::read_bytes(&mut body)?;
        let skic = vlu::read_bytes(&mut body)?;
        Ok(Self {
            initiator_session_id,
            cookie,
            certificate,
            skic,
        })
    }
}

/// Responder keying (chunk 0x78)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RIKeying {
    pub responder_session_id: u32,
    /// Responder session key component
    pub skrc: Bytes,
}

impl RIKeying {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.responder_session_id);
        vlu::write_bytes(&mut buf, &self.skrc);
        buf.put_u8(KEYING_SIGNATURE);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        ensure(body.len(), 4)?;
        let responder_session_id = body.get_u32();
        let skrc = vlu::read_bytes(&mut body)?;
        Ok(Self {
            responder_session_id,
            skrc,
        })
    }
}

/// Certificate and key component option types
pub mod option {
    /// Random nonce inside a certificate
    pub const NONCE: u8 = 0x0E;
    /// Diffie-Hellman group support, or group + public key in a key component
    pub const DH_GROUP: u8 = 0x1D;
}

/// Append one `[len][type][value]` option
pub fn write_option(buf: &mut impl BufMut, kind: u8, value: &[u8]) {
    let inner = vlu::encoded_len(kind as u64) + value.len();
    vlu::write(buf, inner as u64);
    vlu::write(buf, kind as u64);
    buf.put_slice(value);
}

/// Parse an option list until the buffer is exhausted or a zero length
pub fn read_options(mut buf: Bytes) -> Result<Vec<(u8, Bytes)>> {
    let mut options = Vec::new();
    while buf.has_remaining() {
        let len = vlu::read(&mut buf)? as usize;
        if len == 0 {
            break;
        }
        ensure(buf.len(), len)?;
        let mut option = buf.split_to(len);
        let kind = vlu::read(&mut option)? as u8;
        options.push((kind, option));
    }
    Ok(options)
}

/// Build a certificate: 64 random bytes plus the supported DH group
pub fn generate_certificate() -> Bytes {
    let mut nonce = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut buf = BytesMut::new();
    write_option(&mut buf, option::NONCE, &nonce);
    write_option(&mut buf, option::DH_GROUP, &[DH_GROUP_ID]);
    buf.freeze()
}

/// Peer ID derived from a certificate
pub fn peer_id(certificate: &[u8]) -> PeerId {
    let digest = Sha256::digest(certificate);
    let mut id = [0u8; PEER_ID_SIZE];
    id.copy_from_slice(&digest);
    id
}

/// Wrap a DH public key as a session key component
pub fn key_component(public_key: &[u8]) -> Bytes {
    let mut value = Vec::with_capacity(public_key.len() + 1);
    value.push(DH_GROUP_ID);
    value.extend_from_slice(public_key);
    let mut buf = BytesMut::new();
    write_option(&mut buf, option::DH_GROUP, &value);
    buf.freeze()
}

/// Extract the DH public key from a session key component
pub fn parse_key_component(component: &Bytes) -> Result<Bytes> {
    for (kind, value) in read_options(component.clone())? {
        if kind == option::DH_GROUP && value.len() > 1 && value[0] == DH_GROUP_ID {
            return Ok(value.slice(1..));
        }
    }
    Err(Error::InvalidKey(
        "no supported Diffie-Hellman public key".to_string(),
    ))
}
