//! Cipher, session ID and packet framing tests

use rtmfp_core::chunk::{self, ChunkReader, ChunkWriter};
use rtmfp_core::session_id::{pack, unpack};
use rtmfp_core::{Direction, Engine, Error, Marker, Packet, DEFAULT_KEY, MIN_PACKET_SIZE};

#[test]
fn test_cipher_roundtrip() {
    let key = [0x42u8; 16];
    let encoder = Engine::new(&key, Direction::Encrypt);
    let decoder = Engine::new(&key, Direction::Decrypt);

    for len in [16usize, 32, 1184] {
        let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut data = plain.clone();
        encoder.process(&mut data).unwrap();
        assert_ne!(data, plain);
        decoder.process(&mut data).unwrap();
        assert_eq!(data, plain);
    }
}

#[test]
fn test_cipher_rejects_unaligned() {
    let encoder = Engine::handshake(Direction::Encrypt);
    let mut data = vec![0u8; 17];
    assert_eq!(encoder.process(&mut data), Err(Error::Unaligned(17)));
}

#[test]
fn test_handshake_engine_uses_default_key() {
    assert!(Engine::handshake(Direction::Decrypt).uses_key(DEFAULT_KEY));
}

#[test]
fn test_session_id_roundtrip() {
    let mut packet = [0x5Au8; 32];
    for far_id in [0u32, 1, 0x1234_5678, 0x8000_0000, u32::MAX] {
        pack(&mut packet, far_id).unwrap();
        assert_eq!(unpack(&packet).unwrap(), far_id);
    }
}

#[test]
fn test_session_id_only_touches_first_word() {
    let mut packet = [0xA5u8; 16];
    pack(&mut packet, 7).unwrap();
    assert!(packet[4..].iter().all(|&b| b == 0xA5));
}

#[test]
fn test_session_id_needs_minimum_size() {
    let mut packet = [0u8; MIN_PACKET_SIZE - 1];
    assert!(pack(&mut packet, 1).is_err());
    assert!(unpack(&packet).is_err());
}

#[test]
fn test_packet_roundtrip_with_echo() {
    let encoder = Engine::handshake(Direction::Encrypt);
    let decoder = Engine::handshake(Direction::Decrypt);

    let mut writer = ChunkWriter::new(Packet::capacity(true));
    assert!(writer.push(chunk::PING, b"ping"));
    assert!(writer.push(chunk::CLOSE, &[]));
    let packet = Packet::new(Marker::INITIATOR, writer.into_bytes()).with_echo(Some(0x1234));
    assert_eq!(packet.marker, Marker(0x8D));

    let data = packet.encode(0xCAFE_BABE, &encoder).unwrap();
    assert_eq!(unpack(&data).unwrap(), 0xCAFE_BABE);

    let decoded = Packet::decode(&data, &decoder).unwrap();
    assert_eq!(decoded.marker, packet.marker);
    assert_eq!(decoded.time, packet.time);
    assert_eq!(decoded.echo, Some(0x1234));

    let chunks: Vec<_> = ChunkReader::new(decoded.body)
        .collect::<rtmfp_core::Result<_>>()
        .unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].kind, chunk::PING);
    assert_eq!(&chunks[0].body[..], b"ping");
    assert_eq!(chunks[1].kind, chunk::CLOSE);
}

#[test]
fn test_tampered_packet_rejected() {
    let encoder = Engine::handshake(Direction::Encrypt);
    let decoder = Engine::handshake(Direction::Decrypt);
    let mut data = Packet::new(Marker::HANDSHAKE, vec![chunk::PING, 0, 0])
        .encode(0, &encoder)
        .unwrap()
        .to_vec();
    data[10] ^= 0x01;
    assert!(Packet::decode(&data, &decoder).is_err());
}
