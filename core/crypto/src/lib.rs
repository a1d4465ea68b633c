//! Cryptographic primitives for VeilVault.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256 with purpose-tagged salts
//! - Chunked authenticated encryption using AES-256-GCM
//! - Salted Argon2id credential verifiers
//! - Secure key management with automatic zeroization
//! - The self-tested [`EncryptionEngine`] that wraps all of the above
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod checksum;
pub mod encoding;
pub mod engine;
pub mod kdf;
pub mod keys;
pub mod sealed;
pub mod stream;
pub mod verifier;

pub use checksum::{checksums_match, sha256_file, sha256_hex};
pub use engine::{CryptoConfig, EncryptionEngine, FileCipherInfo};
pub use kdf::{derive_key, PRIMARY_MIN_ITERATIONS, RECOVERY_MIN_ITERATIONS};
pub use keys::{EncryptionKey, Iv, KeyPurpose, Salt, KEY_LENGTH, SALT_LENGTH};
pub use sealed::SealedSecret;
pub use stream::{decrypt, encrypt, DecryptingStream, EncryptingStream};
pub use verifier::VerifierParams;
