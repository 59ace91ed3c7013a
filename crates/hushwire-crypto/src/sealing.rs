//! At-rest sealing of persisted key material.
//!
//! Sealed layout: `nonce (24 bytes) || XChaCha20-Poly1305 ciphertext`.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use thiserror::Error;
use zeroize::Zeroize;

/// Size of the random nonce prepended to every sealed record
pub const SEAL_NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Errors opening a sealed record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SealError {
    /// Record is shorter than nonce plus tag
    #[error("sealed record truncated: {len} bytes")]
    Truncated {
        /// Length of the record
        len: usize,
    },

    /// Wrong key or corrupted record
    #[error("sealed record failed authentication")]
    AuthenticationFailed,
}

/// Symmetric key protecting records at rest. Zeroized on drop.
pub struct SealingKey {
    key: [u8; 32],
}

impl SealingKey {
    /// Wrap 32 bytes of key material.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Seal `plaintext` under a caller-provided random nonce.
    pub fn seal(&self, plaintext: &[u8], nonce: [u8; SEAL_NONCE_SIZE]) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        let mut sealed = Vec::with_capacity(SEAL_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        sealed
    }

    /// Open a record produced by [`Self::seal`].
    ///
    /// # Errors
    ///
    /// - `Truncated` if the record cannot hold a nonce and tag
    /// - `AuthenticationFailed` on a wrong key or tampering
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < SEAL_NONCE_SIZE + POLY1305_TAG_SIZE {
            return Err(SealError::Truncated { len: sealed.len() });
        }

        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::AuthenticationFailed)
    }
}

impl Drop for SealingKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
