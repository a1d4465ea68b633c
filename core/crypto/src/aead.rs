//! Authenticated encryption using AES-256-GCM.
//!
//! Single-shot primitives over one buffer. Framing, nonce schedule and
//! associated data for large payloads live in [`crate::stream`].

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::keys::EncryptionKey;
use veilvault_common::{Error, Result};

/// Size of the nonce in bytes (96-bit for AES-GCM).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

fn cipher(key: &EncryptionKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| Error::Crypto("Invalid key length".to_string()))
}

/// Encrypt one buffer under an explicit nonce, authenticating `aad`.
///
/// # Preconditions
/// - `nonce` must never be reused with the same key
///
/// # Postconditions
/// - Returns ciphertext with the 16-byte tag appended
pub fn seal(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    cipher(key)?
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("Encryption failed".to_string()))
}

/// Decrypt one buffer produced by [`seal`].
///
/// # Errors
/// - Returns `Crypto` if the key is wrong, the ciphertext or `aad` was
///   modified, or the input is shorter than a tag
pub fn open(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }
    cipher(key)?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("Decryption failed: authentication error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EncryptionKey::generate();
        let nonce = [3u8; NONCE_SIZE];
        let ct = seal(&key, &nonce, b"hdr", b"Hello, World!").unwrap();
        assert_eq!(ct.len(), 13 + TAG_SIZE);
        assert_eq!(open(&key, &nonce, b"hdr", &ct).unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = [0u8; NONCE_SIZE];
        let ct = seal(&EncryptionKey::generate(), &nonce, b"", b"secret").unwrap();
        assert!(open(&EncryptionKey::generate(), &nonce, b"", &ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let nonce = [0u8; NONCE_SIZE];
        let mut ct = seal(&key, &nonce, b"", b"secret").unwrap();
        ct[0] ^= 0xFF;
        assert!(open(&key, &nonce, b"", &ct).is_err());
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let key = EncryptionKey::generate();
        let nonce = [0u8; NONCE_SIZE];
        let ct = seal(&key, &nonce, b"chunk-0", b"secret").unwrap();
        assert!(open(&key, &nonce, b"chunk-1", &ct).is_err());
    }

    #[test]
    fn test_short_input_fails() {
        let key = EncryptionKey::generate();
        assert!(open(&key, &[0u8; NONCE_SIZE], b"", &[1, 2, 3]).is_err());
    }
}
