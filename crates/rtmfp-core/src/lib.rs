//! RTMFP Core
//!
//! Wire-level primitives for the Secure Real-Time Media Flow Protocol.
//!
//! This crate provides:
//! - The packet cipher ([`Engine`])
//! - Address and session ID codecs ([`address`], [`session_id`])
//! - Key agreement ([`keys`], [`dh`])
//! - Scaled 16-bit timestamps ([`time`])
//! - Packet, chunk and handshake framing ([`packet`], [`chunk`], [`handshake`])
//! - The Flash message layer carried on flows ([`message`], [`amf`], [`flv`])

pub mod address;
pub mod amf;
pub mod chunk;
pub mod cipher;
pub mod dh;
pub mod error;
pub mod flv;
pub mod handshake;
pub mod keys;
pub mod message;
pub mod packet;
pub mod session_id;
pub mod time;
pub mod vlu;

pub use address::AddressType;
pub use cipher::{Direction, Engine};
pub use error::{Error, Result};
pub use keys::{compute_asymmetric_keys, SessionKeys};
pub use packet::{Marker, Packet};

/// Symmetric key size in bytes
pub const KEY_SIZE: usize = 0x10;

/// Key used for handshake packets before session keys exist
pub const DEFAULT_KEY: &[u8; KEY_SIZE] = b"Adobe Systems 02";

/// Largest header: session ID, checksum, marker, time, echo time
pub const HEADER_SIZE: usize = 11;

/// Smallest datagram worth decoding
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + 1;

/// Largest datagram we emit or accept
pub const MAX_PACKET_SIZE: usize = 1192;

/// Milliseconds per timestamp unit
pub const TIMESTAMP_SCALE: i64 = 4;

/// Default RTMFP port
pub const DEFAULT_PORT: u16 = 1935;

/// Peer ID size (SHA-256 of the certificate)
pub const PEER_ID_SIZE: usize = 32;

/// Peer identifier
pub type PeerId = [u8; PEER_ID_SIZE];
