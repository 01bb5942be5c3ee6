//! Session key agreement

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::cipher::{Direction, Engine};
use crate::KEY_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Directional keys for one session
///
/// The initiator encrypts with `request` and decrypts with `response`; the
/// responder does the opposite. Both keys are wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub request: [u8; KEY_SIZE],
    pub response: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Build (encoder, decoder) for the initiator side
    pub fn initiator_engines(&self) -> (Engine, Engine) {
        (
            Engine::new(&self.request, Direction::Encrypt),
            Engine::new(&self.response, Direction::Decrypt),
        )
    }

    /// Build (encoder, decoder) for the responder side
    pub fn responder_engines(&self) -> (Engine, Engine) {
        (
            Engine::new(&self.response, Direction::Encrypt),
            Engine::new(&self.request, Direction::Decrypt),
        )
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.request.zeroize();
        self.response.zeroize();
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Derive the request and response keys for a session.
///
/// ```text
/// mdp1     = HMAC-SHA256(responder_nonce, initiator_nonce)
/// mdp2     = HMAC-SHA256(initiator_nonce, responder_nonce)
/// request  = HMAC-SHA256(shared_secret, mdp1)[..16]
/// response = HMAC-SHA256(shared_secret, mdp2)[..16]
/// ```
///
/// Swapping the two nonces swaps the request and response keys, as every
/// interoperable peer derives them.
///
/// Empty nonces are accepted and give a defined result, but one that no
/// longer depends on the missing side's contribution.
pub fn compute_asymmetric_keys(
    shared_secret: &[u8],
    initiator_nonce: &[u8],
    responder_nonce: &[u8],
) -> SessionKeys {
    let mut mdp1 = hmac_sha256(responder_nonce, initiator_nonce);
    let mut mdp2 = hmac_sha256(initiator_nonce, responder_nonce);

    let mut request_full = hmac_sha256(shared_secret, &mdp1);
    let mut response_full = hmac_sha256(shared_secret, &mdp2);

    let mut keys = SessionKeys {
        request: [0u8; KEY_SIZE],
        response: [0u8; KEY_SIZE],
    };
    keys.request.copy_from_slice(&request_full[..KEY_SIZE]);
    keys.response.copy_from_slice(&response_full[..KEY_SIZE]);

    mdp1.zeroize();
    mdp2.zeroize();
    request_full.zeroize();
    response_full.zeroize();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engines_pair_up() {
        let keys = compute_asymmetric_keys(b"secret", b"initiator", b"responder");
        let (initiator_encoder, initiator_decoder) = keys.initiator_engines();
        let (responder_encoder, responder_decoder) = keys.responder_engines();

        let mut data = [9u8; 32];
        initiator_encoder.process(&mut data).unwrap();
        responder_decoder.process(&mut data).unwrap();
        assert_eq!(data, [9u8; 32]);

        responder_encoder.process(&mut data).unwrap();
        initiator_decoder.process(&mut data).unwrap();
        assert_eq!(data, [9u8; 32]);
    }

    #[test]
    fn test_request_differs_from_response() {
        let keys = compute_asymmetric_keys(b"secret", b"a", b"b");
        assert_ne!(keys.request, keys.response);
    }
}
