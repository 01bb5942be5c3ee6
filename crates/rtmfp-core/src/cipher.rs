//! Packet cipher
//!
//! RTMFP encrypts everything after the scrambled session ID with AES-128 in
//! CBC mode and a fixed all-zero IV. The IV never changes, so two identical
//! plaintexts under one key produce identical ciphertexts; freshness comes
//! from the per-session keys and the timestamps in the packet header.
//! The zero IV is part of the wire format and must stay.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes128;
use zeroize::Zeroize;

use crate::{Error, Result, KEY_SIZE};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

const ZERO_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// Cipher direction, fixed for the life of an [`Engine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Decrypt,
    Encrypt,
}

/// One-direction packet cipher bound to a 128-bit key
///
/// The key schedule is wiped when the engine is dropped.
pub struct Engine {
    key: [u8; KEY_SIZE],
    direction: Direction,
    cipher: Aes128,
}

impl Engine {
    /// Create an engine for `key` in the given direction
    pub fn new(key: &[u8; KEY_SIZE], direction: Direction) -> Self {
        Self {
            key: *key,
            direction,
            cipher: Aes128::new(&(*key).into()),
        }
    }

    /// Engine keyed with the well-known handshake key
    pub fn handshake(direction: Direction) -> Self {
        Self::new(crate::DEFAULT_KEY, direction)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns true if this engine uses the given key
    pub fn uses_key(&self, key: &[u8; KEY_SIZE]) -> bool {
        self.key == *key
    }

    /// Encrypt or decrypt `data` in place.
    ///
    /// The chain restarts from the zero IV on every call. `data` must be a
    /// multiple of [`BLOCK_SIZE`]; the packet framing pads to guarantee it.
    pub fn process(&self, data: &mut [u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(Error::Unaligned(data.len()));
        }

        let len = data.len();
        let iv = aes::Block::from(ZERO_IV);
        match self.direction {
            Direction::Encrypt => {
                cbc::Encryptor::<Aes128>::inner_iv_init(self.cipher.clone(), &iv)
                    .encrypt_padded_mut::<NoPadding>(data, len)
                    .map_err(|_| Error::Unaligned(len))?;
            }
            Direction::Decrypt => {
                cbc::Decryptor::<Aes128>::inner_iv_init(self.cipher.clone(), &iv)
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|_| Error::Unaligned(len))?;
            }
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}
