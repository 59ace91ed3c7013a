//! Group message encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use super::{error::SenderKeyError, ratchet::MessageKey};

/// Size of a group session identifier (16 bytes)
pub const GROUP_SESSION_ID_SIZE: usize = 16;

/// Size of the random suffix in the nonce (12 bytes)
pub const NONCE_RANDOM_SIZE: usize = 12;

/// Bytes of the session id mixed into the nonce prefix
const NONCE_SESSION_PREFIX: usize = 8;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Identifier of one group session (one sender ratchet).
pub type GroupSessionId = [u8; GROUP_SESSION_ID_SIZE];

/// An encrypted group message with the metadata needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedGroupMessage {
    /// Session the sending ratchet belongs to
    pub session_id: GroupSessionId,
    /// The ratchet generation (for key derivation)
    pub generation: u32,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedGroupMessage {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }
}

/// Encrypt a group message using `XChaCha20-Poly1305`.
///
/// # Security
///
/// - Nonce is unique per (session, generation, random)
/// - Session id and generation are authenticated as associated data, so a
///   ciphertext cannot be replayed under another session or generation
/// - Caller MUST provide cryptographically secure random bytes in production
pub fn encrypt_message(
    plaintext: &[u8],
    message_key: &MessageKey,
    session_id: &GroupSessionId,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> EncryptedGroupMessage {
    let generation = message_key.generation();
    let nonce = build_nonce(session_id, generation, random_suffix);
    let aad = associated_data(session_id, generation);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let payload = Payload { msg: plaintext, aad: &aad };
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    EncryptedGroupMessage { session_id: *session_id, generation, nonce, ciphertext }
}

/// Decrypt a group message using `XChaCha20-Poly1305`.
///
/// # Errors
///
/// - `DecryptionFailed`: wrong key, wrong generation, or tampered ciphertext
pub fn decrypt_message(
    encrypted: &EncryptedGroupMessage,
    message_key: &MessageKey,
) -> Result<Vec<u8>, SenderKeyError> {
    if message_key.generation() != encrypted.generation {
        return Err(SenderKeyError::DecryptionFailed {
            reason: format!(
                "generation mismatch: key is {}, message is {}",
                message_key.generation(),
                encrypted.generation
            ),
        });
    }

    let aad = associated_data(&encrypted.session_id, encrypted.generation);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    let nonce = XNonce::from_slice(&encrypted.nonce);
    let payload = Payload { msg: encrypted.ciphertext.as_slice(), aad: &aad };

    cipher.decrypt(nonce, payload).map_err(|_| SenderKeyError::DecryptionFailed {
        reason: "authentication failed".to_string(),
    })
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-7: first 8 bytes of the session id
/// - bytes 8-11: generation (big-endian)
/// - bytes 12-23: random suffix (caller-provided)
fn build_nonce(
    session_id: &GroupSessionId,
    generation: u32,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..NONCE_SESSION_PREFIX].copy_from_slice(&session_id[..NONCE_SESSION_PREFIX]);
    nonce[8..12].copy_from_slice(&generation.to_be_bytes());
    nonce[12..24].copy_from_slice(&random_suffix);
    nonce
}

fn associated_data(session_id: &GroupSessionId, generation: u32) -> [u8; 20] {
    let mut aad = [0u8; GROUP_SESSION_ID_SIZE + 4];
    aad[..GROUP_SESSION_ID_SIZE].copy_from_slice(session_id);
    aad[GROUP_SESSION_ID_SIZE..].copy_from_slice(&generation.to_be_bytes());
    aad
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{super::ratchet::SymmetricRatchet, *};

    const SESSION: GroupSessionId = [0x5A; GROUP_SESSION_ID_SIZE];

    fn test_message_key(target_gen: u32) -> MessageKey {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        SymmetricRatchet::new(&seed).advance_to(target_gen).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let message_key = test_message_key(0);
        let plaintext = b"Hello, World!";

        let encrypted =
            encrypt_message(plaintext, &message_key, &SESSION, [0xAB; NONCE_RANDOM_SIZE]);
        let decrypted = decrypt_message(&encrypted, &message_key).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encrypt_decrypt_empty_message() {
        let message_key = test_message_key(3);

        let encrypted = encrypt_message(b"", &message_key, &SESSION, [0x00; NONCE_RANDOM_SIZE]);
        let decrypted = decrypt_message(&encrypted, &message_key).unwrap();

        assert!(decrypted.is_empty());
    }

    #[test]
    fn encrypted_message_has_correct_metadata() {
        let message_key = test_message_key(5);

        let encrypted = encrypt_message(b"test", &message_key, &SESSION, [0x00; NONCE_RANDOM_SIZE]);

        assert_eq!(encrypted.session_id, SESSION);
        assert_eq!(encrypted.generation, 5);
        assert_eq!(encrypted.plaintext_len(), 4);
        assert_eq!(encrypted.ciphertext.len(), 4 + POLY1305_TAG_SIZE);
    }

    #[test]
    fn rebinding_to_another_session_fails() {
        let message_key = test_message_key(0);
        let mut encrypted =
            encrypt_message(b"secret", &message_key, &SESSION, [0x00; NONCE_RANDOM_SIZE]);

        encrypted.session_id[15] ^= 0x01;

        let result = decrypt_message(&encrypted, &message_key);
        assert!(matches!(result, Err(SenderKeyError::DecryptionFailed { .. })));
    }

    #[test]
    fn wrong_generation_key_fails() {
        let encrypted =
            encrypt_message(b"secret", &test_message_key(1), &SESSION, [0x00; NONCE_RANDOM_SIZE]);

        let result = decrypt_message(&encrypted, &test_message_key(2));
        assert!(matches!(
            result,
            Err(SenderKeyError::DecryptionFailed { reason }) if reason.contains("generation")
        ));
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let encrypted =
            encrypt_message(b"secret", &test_message_key(0), &SESSION, [0x00; NONCE_RANDOM_SIZE]);

        let wrong_key = SymmetricRatchet::new(&[0xFF; 32]).advance().unwrap();

        let result = decrypt_message(&encrypted, &wrong_key);
        assert!(matches!(
            result,
            Err(SenderKeyError::DecryptionFailed { reason }) if reason.contains("authentication")
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let message_key = test_message_key(0);
        let mut encrypted =
            encrypt_message(b"original message", &message_key, &SESSION, [0x00; NONCE_RANDOM_SIZE]);

        encrypted.ciphertext[0] ^= 0xFF;

        assert!(decrypt_message(&encrypted, &message_key).is_err());
    }

    #[test]
    fn different_random_produces_different_nonces() {
        let message_key = test_message_key(0);

        let a = encrypt_message(b"test", &message_key, &SESSION, [0x00; NONCE_RANDOM_SIZE]);
        let b = encrypt_message(b"test", &message_key, &SESSION, [0xFF; NONCE_RANDOM_SIZE]);

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn nonce_structure() {
        let mut session = [0u8; GROUP_SESSION_ID_SIZE];
        for (i, byte) in session.iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }
        let nonce = build_nonce(&session, 0x0D_0E_0F_10, [0xAB; NONCE_RANDOM_SIZE]);

        assert_eq!(&nonce[0..8], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&nonce[8..12], &[0x0D, 0x0E, 0x0F, 0x10]);
        assert_eq!(&nonce[12..24], &[0xAB; NONCE_RANDOM_SIZE]);
    }
}
