//! Packet framing benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rtmfp_core::chunk::{self, UserData};
use rtmfp_core::{Direction, Engine, Marker, Packet};

fn media_packet() -> Packet {
    let fragment = UserData {
        flow_id: 3,
        sequence: 120,
        fsn_offset: 1,
        payload: vec![0x17; 1024].into(),
        ..Default::default()
    };
    let mut body = Vec::new();
    body.push(chunk::USER_DATA);
    body.extend_from_slice(&(fragment.encoded_len() as u16).to_be_bytes());
    fragment.encode(&mut body);
    Packet::new(Marker::INITIATOR, body).with_echo(Some(42))
}

fn encode_benchmark(c: &mut Criterion) {
    let packet = media_packet();
    let encoder = Engine::new(&[7u8; 16], Direction::Encrypt);

    c.bench_function("encode_media_packet", |b| {
        b.iter(|| black_box(packet.encode(0x0102_0304, &encoder).unwrap()))
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let encoder = Engine::new(&[7u8; 16], Direction::Encrypt);
    let decoder = Engine::new(&[7u8; 16], Direction::Decrypt);
    let data = media_packet().encode(0x0102_0304, &encoder).unwrap();

    c.bench_function("decode_media_packet", |b| {
        b.iter(|| black_box(Packet::decode(&data, &decoder).unwrap()))
    });
}

criterion_group!(benches, encode_benchmark, decode_benchmark);
criterion_main!(benches);
