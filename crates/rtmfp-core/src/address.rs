//! Endpoint address codec
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ Byte 0:   [7] IPv6 flag  [1:0] address type      │
//! │ 4 or 16:  address bytes (network order)          │
//! │ 2:        port (big-endian)                      │
//! └──────────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::ensure;
use crate::{Error, Result};

/// IPv6 flag in the type byte
pub const IPV6_FLAG: u8 = 0x80;

/// Role of an address in a candidate list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AddressType {
    #[default]
    Unspecified = 0,
    Local = 1,
    Public = 2,
    Redirection = 3,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AddressType::Unspecified),
            1 => Some(AddressType::Local),
            2 => Some(AddressType::Public),
            3 => Some(AddressType::Redirection),
            _ => None,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Unspecified => write!(f, "unspecified"),
            AddressType::Local => write!(f, "local"),
            AddressType::Public => write!(f, "public"),
            AddressType::Redirection => write!(f, "redirection"),
        }
    }
}

/// Encoded size of an address
pub fn encoded_len(address: &SocketAddr) -> usize {
    match address {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}

/// Write one tagged address
pub fn write_address(buf: &mut impl BufMut, address: &SocketAddr, kind: AddressType) {
    match address.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(kind as u8);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(kind as u8 | IPV6_FLAG);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(address.port());
}

/// Read one tagged address
pub fn read_address(buf: &mut impl Buf) -> Result<(SocketAddr, AddressType)> {
    ensure(buf.remaining(), 1)?;
    let tag = buf.get_u8();
    let kind = AddressType::from_u8(tag & !IPV6_FLAG).ok_or(Error::InvalidAddressType(tag))?;

    let ip = if tag & IPV6_FLAG != 0 {
        ensure(buf.remaining(), 16 + 2)?;
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        ensure(buf.remaining(), 4 + 2)?;
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        IpAddr::V4(Ipv4Addr::from(octets))
    };
    let port = buf.get_u16();

    Ok((SocketAddr::new(ip, port), kind))
}

/// Read addresses until the buffer is exhausted
pub fn read_addresses(buf: &mut impl Buf) -> Result<Vec<(SocketAddr, AddressType)>> {
    let mut addresses = Vec::new();
    while buf.has_remaining() {
        addresses.push(read_address(buf)?);
    }
    Ok(addresses)
}
