//! Password-based key derivation using PBKDF2-HMAC-SHA256.
//!
//! Every derivation is bound to a [`KeyPurpose`] through its salt, and the
//! iteration count must meet the floor for that purpose.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::keys::{EncryptionKey, KeyPurpose, Salt, KEY_LENGTH};
use veilvault_common::{Error, Result};

/// Minimum PBKDF2 iterations for keys derived from the master key.
pub const PRIMARY_MIN_ITERATIONS: u32 = 100_000;

/// Minimum PBKDF2 iterations for keys derived from the recovery key.
pub const RECOVERY_MIN_ITERATIONS: u32 = 50_000;

/// Derive a 256-bit key from a passphrase and a purpose-tagged salt.
///
/// # Preconditions
/// - `passphrase` must not be empty
/// - `iterations` must be at least `salt.purpose().min_iterations()`
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
/// - Salts of different purposes never produce the same key
///
/// # Errors
/// - Returns `InvalidInput` if the passphrase is empty
/// - Returns `Crypto` if the iteration count is below the purpose's floor
///
/// # Security
/// - Passphrase is not stored or logged
pub fn derive_key(passphrase: &[u8], salt: &Salt, iterations: u32) -> Result<EncryptionKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
    }

    let floor = salt.purpose().min_iterations();
    if iterations < floor {
        return Err(Error::Crypto(format!(
            "{} iterations is below the minimum of {} for {:?} keys",
            iterations,
            floor,
            salt.purpose()
        )));
    }

    let mut key_bytes = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(passphrase, &salt.kdf_input(), iterations, &mut key_bytes);
    Ok(EncryptionKey::from_bytes(key_bytes))
}

/// Iteration floor check without deriving, used by configuration validation.
pub fn check_iterations(purpose: KeyPurpose, iterations: u32) -> Result<()> {
    if iterations < purpose.min_iterations() {
        return Err(Error::InvalidInput(format!(
            "{:?} keys need at least {} iterations, got {}",
            purpose,
            purpose.min_iterations(),
            iterations
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let salt = Salt::generate(KeyPurpose::MasterKeyWrap);

        let key1 = derive_key(b"test password", &salt, RECOVERY_MIN_ITERATIONS).unwrap();
        let key2 = derive_key(b"test password", &salt, RECOVERY_MIN_ITERATIONS).unwrap();

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_different_salts_different_keys() {
        let salt1 = Salt::generate(KeyPurpose::MasterKeyWrap);
        let salt2 = Salt::generate(KeyPurpose::MasterKeyWrap);

        let key1 = derive_key(b"test password", &salt1, RECOVERY_MIN_ITERATIONS).unwrap();
        let key2 = derive_key(b"test password", &salt2, RECOVERY_MIN_ITERATIONS).unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_empty_passphrase_fails() {
        let salt = Salt::generate(KeyPurpose::MasterKeyWrap);
        assert!(derive_key(b"", &salt, RECOVERY_MIN_ITERATIONS).is_err());
    }

    #[test]
    fn test_iterations_below_floor_rejected() {
        let primary = Salt::generate(KeyPurpose::FolderContent);
        assert!(derive_key(b"pw", &primary, 99_999).is_err());

        let recovery = Salt::generate(KeyPurpose::MasterKeyWrap);
        assert!(derive_key(b"pw", &recovery, 49_999).is_err());
    }

    #[test]
    fn test_check_iterations() {
        assert!(check_iterations(KeyPurpose::FolderContent, 100_000).is_ok());
        assert!(check_iterations(KeyPurpose::FolderContent, 50_000).is_err());
        assert!(check_iterations(KeyPurpose::MasterKeyWrap, 50_000).is_ok());
    }
}
