//! Diffie-Hellman over the 1024-bit MODP group (RFC 2409 group 2)
//!
//! Produces the shared secret fed to [`compute_asymmetric_keys`](crate::keys::compute_asymmetric_keys).

use num_bigint::BigUint;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::{Error, Result};

/// Size of public keys and shared secrets in bytes
pub const DH_KEY_SIZE: usize = 128;

/// Group identifier carried next to public keys on the wire
pub const DH_GROUP_ID: u8 = 0x02;

const PRIME: [u8; DH_KEY_SIZE] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2, 0x34,
    0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74,
    0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37,
    0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6,
    0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6,
    0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

const GENERATOR: u32 = 2;

/// Left-pad a big-endian integer to the fixed key size
fn to_fixed(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; DH_KEY_SIZE.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

/// One ephemeral key pair
pub struct DiffieHellman {
    private: Zeroizing<Vec<u8>>,
    public: Vec<u8>,
}

impl DiffieHellman {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        let mut private = Zeroizing::new(vec![0u8; DH_KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut private);
        Self::from_private(private)
    }

    fn from_private(private: Zeroizing<Vec<u8>>) -> Self {
        let prime = BigUint::from_bytes_be(&PRIME);
        let exponent = BigUint::from_bytes_be(&private);
        let public = BigUint::from(GENERATOR).modpow(&exponent, &prime);
        Self {
            private,
            public: to_fixed(&public),
        }
    }

    /// Our public key, 128 bytes big-endian
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Compute the shared secret from the far side's public key
    pub fn compute_secret(&self, far_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let prime = BigUint::from_bytes_be(&PRIME);
        let far = BigUint::from_bytes_be(far_public);
        let one = BigUint::from(1u32);
        if far <= one || far >= &prime - &one {
            return Err(Error::InvalidKey("far public key out of range".to_string()));
        }

        let exponent = BigUint::from_bytes_be(&self.private);
        let secret = far.modpow(&exponent, &prime);
        let mut bytes = to_fixed(&secret);
        let out = Zeroizing::new(bytes.clone());
        bytes.zeroize();
        Ok(out)
    }
}

impl std::fmt::Debug for DiffieHellman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffieHellman")
            .field("public", &self.public.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agrees() {
        let alice = DiffieHellman::generate();
        let bob = DiffieHellman::generate();
        assert_eq!(alice.public_key().len(), DH_KEY_SIZE);

        let a = alice.compute_secret(bob.public_key()).unwrap();
        let b = bob.compute_secret(alice.public_key()).unwrap();
        assert_eq!(*a, *b);
        assert_eq!(a.len(), DH_KEY_SIZE);
    }

    #[test]
    fn test_rejects_degenerate_keys() {
        let alice = DiffieHellman::generate();
        assert!(alice.compute_secret(&[1]).is_err());
        assert!(alice.compute_secret(&PRIME).is_err());
    }
}
