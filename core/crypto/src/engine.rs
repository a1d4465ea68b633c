//! The encryption engine: configured, self-tested entry point to every
//! cryptographic operation the rest of VeilVault performs.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::checksum::{HashingReader, HashingWriter};
use crate::kdf::{self, PRIMARY_MIN_ITERATIONS, RECOVERY_MIN_ITERATIONS};
use crate::keys::{EncryptionKey, Iv, KeyPurpose, Salt};
use crate::sealed::SealedSecret;
use crate::stream::{self, DecryptingStream, EncryptingStream, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::verifier::{self, VerifierParams};
use veilvault_common::{Error, Passphrase, Result, SensitiveBytes};

/// Cryptographic configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2 iterations for keys derived from the master key.
    pub primary_iterations: u32,
    /// PBKDF2 iterations for keys derived from the recovery key.
    pub recovery_iterations: u32,
    /// Plaintext bytes per stream chunk.
    pub chunk_size: usize,
    /// Argon2id parameters for credential verifiers.
    pub verifier: VerifierParams,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            primary_iterations: PRIMARY_MIN_ITERATIONS,
            recovery_iterations: RECOVERY_MIN_ITERATIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verifier: VerifierParams::default(),
        }
    }
}

impl CryptoConfig {
    /// Validate iteration floors, chunk size and verifier parameters.
    pub fn validate(&self) -> Result<()> {
        kdf::check_iterations(KeyPurpose::FolderContent, self.primary_iterations)?;
        kdf::check_iterations(KeyPurpose::MasterKeyWrap, self.recovery_iterations)?;
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "chunk_size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        self.verifier.validate()
    }
}

/// Digests and size recorded when a file is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCipherInfo {
    pub iv: Iv,
    pub plaintext_len: u64,
    pub plaintext_sha256: String,
    pub ciphertext_sha256: String,
}

/// Self-tested encryption engine.
///
/// A value of this type exists only if [`EncryptionEngine::self_test`]
/// passed, so every component holding one may assume the primitives work.
#[derive(Debug)]
pub struct EncryptionEngine {
    config: CryptoConfig,
}

impl EncryptionEngine {
    /// Validate configuration and run the startup self-test.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid configuration
    /// - `SelfTest` if any self-test check fails; this is fatal and no
    ///   dependent component can be built
    pub fn new(config: CryptoConfig) -> Result<Self> {
        config.validate()?;
        let engine = Self { config };
        if let Err(e) = engine.self_test() {
            error!(error = %e, "Encryption engine self-test failed");
            return Err(e);
        }
        info!(
            primary_iterations = engine.config.primary_iterations,
            recovery_iterations = engine.config.recovery_iterations,
            chunk_size = engine.config.chunk_size,
            "Encryption engine initialized"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    /// Iteration count used for a salt's purpose.
    pub fn iterations_for(&self, purpose: KeyPurpose) -> u32 {
        if purpose.is_recovery_flow() {
            self.config.recovery_iterations
        } else {
            self.config.primary_iterations
        }
    }

    /// Derive a key from a passphrase using the iteration count configured
    /// for the salt's purpose.
    pub fn derive_key(&self, passphrase: &Passphrase, salt: &Salt) -> Result<EncryptionKey> {
        kdf::derive_key(passphrase.as_bytes(), salt, self.iterations_for(salt.purpose()))
    }

    /// Encrypt a buffer with a fresh IV.
    pub fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> Result<(Iv, Vec<u8>)> {
        stream::encrypt(plaintext, key, self.config.chunk_size)
    }

    /// Decrypt a buffer. Fails on any authentication error.
    pub fn decrypt(&self, iv: &Iv, ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
        stream::decrypt(iv, ciphertext, key)
    }

    /// Encrypt `src` into `dst` in bounded memory.
    ///
    /// # Postconditions
    /// - `dst` holds the framed ciphertext, fsynced
    /// - Returns digests of both plaintext and ciphertext
    pub fn encrypt_file(&self, src: &Path, dst: &Path, key: &EncryptionKey) -> Result<FileCipherInfo> {
        let iv = Iv::generate();
        let mut reader = HashingReader::new(BufReader::new(File::open(src)?));
        let mut writer = HashingWriter::new(BufWriter::new(File::create(dst)?));

        EncryptingStream::new(key)
            .with_chunk_size(self.config.chunk_size)
            .encrypt_stream(&iv, &mut reader, &mut writer)?;

        let (plaintext_sha256, plaintext_len) = reader.finish();
        let (buffered, ciphertext_sha256, _) = writer.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;

        debug!(bytes = plaintext_len, "File encrypted");
        Ok(FileCipherInfo {
            iv,
            plaintext_len,
            plaintext_sha256,
            ciphertext_sha256,
        })
    }

    /// Decrypt `src` into `dst`, returning the plaintext SHA-256.
    ///
    /// On error `dst` may hold partial plaintext; callers decrypt into
    /// staging.
    pub fn decrypt_file(&self, iv: &Iv, src: &Path, dst: &Path, key: &EncryptionKey) -> Result<String> {
        let reader = BufReader::new(File::open(src)?);
        let mut writer = HashingWriter::new(BufWriter::new(File::create(dst)?));

        DecryptingStream::new(key).decrypt_stream(iv, reader, &mut writer)?;

        let (buffered, plaintext_sha256, _) = writer.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(plaintext_sha256)
    }

    /// Seal a small secret under a key derived from `passphrase`.
    pub fn seal(&self, secret: &[u8], passphrase: &Passphrase, purpose: KeyPurpose) -> Result<SealedSecret> {
        let salt = Salt::generate(purpose);
        let key = self.derive_key(passphrase, &salt)?;
        let (iv, ciphertext) = self.encrypt(secret, &key)?;
        Ok(SealedSecret {
            salt,
            iv,
            ciphertext,
        })
    }

    /// Open a sealed secret. A wrong passphrase fails authentication.
    pub fn unseal(&self, sealed: &SealedSecret, passphrase: &Passphrase) -> Result<SensitiveBytes> {
        let key = self.derive_key(passphrase, &sealed.salt)?;
        let plaintext = self.decrypt(&sealed.iv, &sealed.ciphertext, &key)?;
        Ok(SensitiveBytes::new(plaintext))
    }

    /// Produce an Argon2id verifier for a credential.
    pub fn hash_credential(&self, secret: &Passphrase) -> Result<String> {
        verifier::hash_secret(secret.as_bytes(), &self.config.verifier)
    }

    /// Check a credential against its stored verifier.
    pub fn verify_credential(&self, secret: &Passphrase, phc: &str) -> Result<bool> {
        verifier::verify_secret(secret.as_bytes(), phc)
    }

    /// Run the startup self-test.
    ///
    /// Checks randomness quality, KDF determinism and domain separation,
    /// round-trip correctness, wrong-key rejection and tamper rejection.
    ///
    /// # Errors
    /// - `SelfTest` naming the first failed check
    pub fn self_test(&self) -> Result<()> {
        check_randomness()?;

        let passphrase = Passphrase::new("veilvault-self-test");
        let salt = Salt::generate(KeyPurpose::FolderContent);
        let key = self
            .derive_key(&passphrase, &salt)
            .map_err(|e| Error::SelfTest(format!("key derivation: {}", e)))?;
        let again = self
            .derive_key(&passphrase, &salt)
            .map_err(|e| Error::SelfTest(format!("key derivation: {}", e)))?;
        if key != again {
            return Err(Error::SelfTest("key derivation is not deterministic".to_string()));
        }
        let other_salt = Salt::from_bytes(KeyPurpose::LegacyKeyWrap, *salt.as_bytes());
        let other = self
            .derive_key(&passphrase, &other_salt)
            .map_err(|e| Error::SelfTest(format!("key derivation: {}", e)))?;
        if key == other {
            return Err(Error::SelfTest("key purposes are not separated".to_string()));
        }

        let mut plaintext = vec![0u8; 3 * 1024 + 17];
        rand::thread_rng().fill_bytes(&mut plaintext);
        let (iv, ciphertext) = stream::encrypt(&plaintext, &key, 1024)
            .map_err(|e| Error::SelfTest(format!("encryption: {}", e)))?;
        let roundtrip = stream::decrypt(&iv, &ciphertext, &key)
            .map_err(|e| Error::SelfTest(format!("decryption: {}", e)))?;
        if roundtrip != plaintext {
            return Err(Error::SelfTest("round trip mismatch".to_string()));
        }

        if stream::decrypt(&iv, &ciphertext, &other).is_ok() {
            return Err(Error::SelfTest("wrong key was accepted".to_string()));
        }

        let mut tampered = ciphertext.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        if stream::decrypt(&iv, &tampered, &key).is_ok() {
            return Err(Error::SelfTest("tampered ciphertext was accepted".to_string()));
        }

        debug!("Encryption engine self-test passed");
        Ok(())
    }
}

const MONOBIT_SAMPLE: usize = 4096;

fn check_randomness() -> Result<()> {
    let mut rng = rand::thread_rng();

    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    rng.fill_bytes(&mut a);
    rng.fill_bytes(&mut b);
    if a == b {
        return Err(Error::SelfTest("random source repeated output".to_string()));
    }
    if a.iter().all(|&x| x == 0) || b.iter().all(|&x| x == 0) {
        return Err(Error::SelfTest("random source returned zeros".to_string()));
    }
    if Iv::generate() == Iv::generate() {
        return Err(Error::SelfTest("IV generation repeated".to_string()));
    }

    let mut sample = vec![0u8; MONOBIT_SAMPLE];
    rng.fill_bytes(&mut sample);
    monobit_ok(&sample)
}

/// Fraction of set bits must lie within [0.45, 0.55].
fn monobit_ok(sample: &[u8]) -> Result<()> {
    let ones: u64 = sample.iter().map(|b| u64::from(b.count_ones())).sum();
    let total = (sample.len() * 8) as f64;
    let ratio = ones as f64 / total;
    if !(0.45..=0.55).contains(&ratio) {
        return Err(Error::SelfTest(format!(
            "random source bit balance out of range: {:.3}",
            ratio
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn test_config() -> CryptoConfig {
        CryptoConfig {
            chunk_size: 64,
            verifier: VerifierParams::insecure_fast(),
            ..CryptoConfig::default()
        }
    }

    #[test]
    fn test_engine_passes_self_test() {
        let engine = EncryptionEngine::new(test_config()).unwrap();
        assert!(engine.self_test().is_ok());
    }

    #[test]
    fn test_config_below_floor_rejected() {
        let config = CryptoConfig {
            primary_iterations: 1000,
            ..test_config()
        };
        assert!(matches!(
            EncryptionEngine::new(config),
            Err(Error::InvalidInput(_))
        ));

        let config = CryptoConfig {
            recovery_iterations: 49_999,
            ..test_config()
        };
        assert!(EncryptionEngine::new(config).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_with_derived_key() {
        let engine = EncryptionEngine::new(test_config()).unwrap();
        let salt = Salt::generate(KeyPurpose::FolderContent);
        let key = engine.derive_key(&Passphrase::new("M1"), &salt).unwrap();

        let (iv, ct) = engine.encrypt(b"quarterly numbers", &key).unwrap();
        assert_eq!(engine.decrypt(&iv, &ct, &key).unwrap(), b"quarterly numbers");

        let wrong = engine.derive_key(&Passphrase::new("M2"), &salt).unwrap();
        assert!(engine.decrypt(&iv, &ct, &wrong).is_err());
    }

    #[test]
    fn test_seal_unseal() {
        let engine = EncryptionEngine::new(test_config()).unwrap();
        let pass = Passphrase::new("recovery");
        let sealed = engine
            .seal(b"the master key", &pass, KeyPurpose::MasterKeyWrap)
            .unwrap();

        assert_eq!(sealed.purpose(), KeyPurpose::MasterKeyWrap);
        let opened = engine.unseal(&sealed, &pass).unwrap();
        assert_eq!(opened.as_bytes(), b"the master key");
        assert!(engine.unseal(&sealed, &Passphrase::new("garbage")).is_err());
    }

    #[test]
    fn test_sealed_secret_survives_json() {
        let engine = EncryptionEngine::new(test_config()).unwrap();
        let pass = Passphrase::new("pw");
        let sealed = engine.seal(b"abc", &pass, KeyPurpose::RecoveryKeyWrap).unwrap();

        let json = serde_json::to_string(&sealed).unwrap();
        let back: SealedSecret = serde_json::from_str(&json).unwrap();
        assert_eq!(engine.unseal(&back, &pass).unwrap().as_bytes(), b"abc");
    }

    #[test]
    fn test_encrypt_file_roundtrip() {
        let engine = EncryptionEngine::new(test_config()).unwrap();
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("plain.txt");
        let enc = dir.path().join("plain.enc");
        let out = dir.path().join("plain.out");
        let content: Vec<u8> = (0..500u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let key = EncryptionKey::generate();
        let info = engine.encrypt_file(&src, &enc, &key).unwrap();
        assert_eq!(info.plaintext_len, 500);
        assert_eq!(info.plaintext_sha256, crate::checksum::sha256_hex(&content));
        assert_eq!(
            info.ciphertext_sha256,
            crate::checksum::sha256_hex(&std::fs::read(&enc).unwrap())
        );

        let digest = engine.decrypt_file(&info.iv, &enc, &out, &key).unwrap();
        assert_eq!(digest, info.plaintext_sha256);
        assert_eq!(std::fs::read(&out).unwrap(), content);
    }

    #[test]
    fn test_credential_verifier() {
        let engine = EncryptionEngine::new(test_config()).unwrap();
        let phc = engine.hash_credential(&Passphrase::new("M1")).unwrap();
        assert!(engine.verify_credential(&Passphrase::new("M1"), &phc).unwrap());
        assert!(!engine.verify_credential(&Passphrase::new("M2"), &phc).unwrap());
    }

    #[test]
    fn test_monobit_rejects_degenerate_sample() {
        assert!(monobit_ok(&[0u8; 512]).is_err());
        assert!(monobit_ok(&[0xFFu8; 512]).is_err());
        assert!(monobit_ok(&[0x55u8; 512]).is_ok());
    }
}
