//! Scrambled session ID
//!
//! The first 4 bytes of every datagram carry the receiver's session ID XORed
//! with the next two big-endian words of the (already encrypted) packet.
//! The field is always 4 bytes wide.

use crate::error::ensure;
use crate::{Result, MIN_PACKET_SIZE};

/// Width of the packed field
pub const SESSION_ID_SIZE: usize = 4;

fn word(packet: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        packet[offset],
        packet[offset + 1],
        packet[offset + 2],
        packet[offset + 3],
    ])
}

/// Write `far_id` into the first 4 bytes of an encrypted packet
pub fn pack(packet: &mut [u8], far_id: u32) -> Result<()> {
    ensure(packet.len(), MIN_PACKET_SIZE)?;
    let scrambled = far_id ^ word(packet, 4) ^ word(packet, 8);
    packet[..SESSION_ID_SIZE].copy_from_slice(&scrambled.to_be_bytes());
    Ok(())
}

/// Recover the session ID from a received packet
pub fn unpack(packet: &[u8]) -> Result<u32> {
    ensure(packet.len(), MIN_PACKET_SIZE)?;
    Ok(word(packet, 0) ^ word(packet, 4) ^ word(packet, 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_body_is_identity() {
        let mut packet = [0u8; MIN_PACKET_SIZE];
        pack(&mut packet, 0x0102_0304).unwrap();
        assert_eq!(&packet[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_pack_touches_only_header_field() {
        let mut packet: Vec<u8> = (0..32u8).collect();
        let body = packet[SESSION_ID_SIZE..].to_vec();
        pack(&mut packet, 77).unwrap();
        assert_eq!(&packet[SESSION_ID_SIZE..], &body[..]);
    }

    #[test]
    fn test_short_packet() {
        assert!(unpack(&[0u8; 11]).is_err());
        assert!(pack(&mut [0u8; 4], 1).is_err());
    }
}
