//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding;

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of salts in bytes.
pub const SALT_LENGTH: usize = 32;

/// Length of the per-encryption IV in bytes (96-bit GCM nonce).
pub const IV_LENGTH: usize = 12;

/// Symmetric key used for AES-256-GCM.
///
/// Produced by PBKDF2 from a passphrase or by sub-key derivation from
/// another key. Never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_LENGTH],
}

impl EncryptionKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Derive the key for a single file from this folder key and the file's
    /// own random salt.
    ///
    /// Uses blake2b for secure key derivation.
    pub fn derive_file_key(&self, file_salt: &[u8]) -> EncryptionKey {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(&self.key);
        hasher.update(file_salt);
        hasher.update(b"filekey");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        EncryptionKey::from_bytes(derived)
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// What a derived key is used for.
///
/// The purpose is mixed into the key-derivation input, so two salts with
/// identical random bytes but different purposes never yield the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    /// Folder content key derived from the master key.
    FolderContent,
    /// Key derived from the master key that wraps the recovery key.
    RecoveryKeyWrap,
    /// Key derived from the recovery key that wraps the master key.
    MasterKeyWrap,
    /// Key derived from the current master key that wraps a superseded one.
    LegacyKeyWrap,
}

impl KeyPurpose {
    /// Domain-separation tag prepended to the salt bytes.
    pub fn tag(&self) -> &'static [u8] {
        match self {
            KeyPurpose::FolderContent => b"veilvault/folder-content/v1",
            KeyPurpose::RecoveryKeyWrap => b"veilvault/recovery-key-wrap/v1",
            KeyPurpose::MasterKeyWrap => b"veilvault/master-key-wrap/v1",
            KeyPurpose::LegacyKeyWrap => b"veilvault/legacy-key-wrap/v1",
        }
    }

    /// Whether keys of this purpose are derived from the recovery key.
    pub fn is_recovery_flow(&self) -> bool {
        matches!(self, KeyPurpose::MasterKeyWrap)
    }

    /// Lowest PBKDF2 iteration count accepted for this purpose.
    pub fn min_iterations(&self) -> u32 {
        if self.is_recovery_flow() {
            crate::kdf::RECOVERY_MIN_ITERATIONS
        } else {
            crate::kdf::PRIMARY_MIN_ITERATIONS
        }
    }
}

/// Purpose-tagged salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt {
    purpose: KeyPurpose,
    #[serde(with = "encoding::b64_array")]
    bytes: [u8; SALT_LENGTH],
}

impl Salt {
    /// Generate a random salt for the given purpose.
    pub fn generate(purpose: KeyPurpose) -> Self {
        let mut bytes = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { purpose, bytes }
    }

    /// Create from bytes.
    pub fn from_bytes(purpose: KeyPurpose, bytes: [u8; SALT_LENGTH]) -> Self {
        Self { purpose, bytes }
    }

    /// The purpose this salt was generated for.
    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.bytes
    }

    /// Salt input actually fed to the KDF: purpose tag followed by the
    /// random bytes.
    pub(crate) fn kdf_input(&self) -> Vec<u8> {
        let tag = self.purpose.tag();
        let mut input = Vec::with_capacity(tag.len() + 1 + SALT_LENGTH);
        input.extend_from_slice(tag);
        input.push(0);
        input.extend_from_slice(&self.bytes);
        input
    }
}

/// Random initialization vector for one encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iv(#[serde(with = "encoding::b64_array")] [u8; IV_LENGTH]);

impl Iv {
    /// Generate a random IV.
    pub fn generate() -> Self {
        let mut iv = [0u8; IV_LENGTH];
        rand::thread_rng().fill_bytes(&mut iv);
        Self(iv)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; IV_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the IV bytes.
    pub fn as_bytes(&self) -> &[u8; IV_LENGTH] {
        &self.0
    }
}
