//! Key agreement tests

use rtmfp_core::dh::DiffieHellman;
use rtmfp_core::handshake::{key_component, parse_key_component};
use rtmfp_core::{compute_asymmetric_keys, KEY_SIZE};

#[test]
fn test_deterministic() {
    let a = compute_asymmetric_keys(b"shared", b"nonce-i", b"nonce-r");
    let b = compute_asymmetric_keys(b"shared", b"nonce-i", b"nonce-r");
    assert_eq!(a, b);
    assert_eq!(a.request.len(), KEY_SIZE);
}

#[test]
fn test_request_and_response_keys_differ() {
    let keys = compute_asymmetric_keys(b"shared", b"nonce-i", b"nonce-r");
    assert_ne!(keys.request, keys.response);
}

#[test]
fn test_swapping_nonces_swaps_key_roles() {
    let a = compute_asymmetric_keys(b"shared", b"nonce-i", b"nonce-r");
    let b = compute_asymmetric_keys(b"shared", b"nonce-r", b"nonce-i");
    // ordered pairs differ, but the same two keys come back in swapped roles
    assert_ne!(a, b);
    assert_eq!(a.request, b.response);
    assert_eq!(a.response, b.request);
}

#[test]
fn test_empty_nonces_are_defined() {
    let a = compute_asymmetric_keys(b"shared", b"", b"");
    let b = compute_asymmetric_keys(b"shared", b"", b"");
    assert_eq!(a, b);
}

#[test]
fn test_full_agreement() {
    let initiator = DiffieHellman::generate();
    let responder = DiffieHellman::generate();
    let skic = key_component(initiator.public_key());
    let skrc = key_component(responder.public_key());

    let initiator_secret = initiator
        .compute_secret(&parse_key_component(&skrc).unwrap())
        .unwrap();
    let responder_secret = responder
        .compute_secret(&parse_key_component(&skic).unwrap())
        .unwrap();

    let initiator_keys = compute_asymmetric_keys(&initiator_secret, &skic, &skrc);
    let responder_keys = compute_asymmetric_keys(&responder_secret, &skic, &skrc);
    assert_eq!(initiator_keys, responder_keys);

    let (encoder, _) = initiator_keys.initiator_engines();
    let (_, decoder) = responder_keys.responder_engines();
    let mut data = *b"0123456789abcdef";
    encoder.process(&mut data).unwrap();
    decoder.process(&mut data).unwrap();
    assert_eq!(&data, b"0123456789abcdef");
}
