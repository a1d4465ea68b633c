//! Salted credential verifiers using Argon2id.
//!
//! Verifiers are stored as PHC strings (`$argon2id$v=19$m=...`) so the
//! parameters travel with the hash and can be raised later without
//! invalidating existing records.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{
    self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use veilvault_common::{Error, Result};

/// Parameters for Argon2id credential verifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Number of passes.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl VerifierParams {
    /// OWASP-recommended interactive parameters (19 MiB, 2 passes).
    pub fn interactive() -> Self {
        Self {
            memory_cost: 19_456,
            time_cost: 2,
            parallelism: 1,
        }
    }

    /// Cheap parameters for tests.
    pub fn insecure_fast() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn build(&self) -> Result<Argon2<'static>> {
        let params = Params::new(self.memory_cost, self.time_cost, self.parallelism, None)
            .map_err(|e| Error::InvalidInput(format!("Invalid verifier parameters: {}", e)))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Validate without hashing.
    pub fn validate(&self) -> Result<()> {
        self.build().map(|_| ())
    }
}

impl Default for VerifierParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Hash a secret into a self-describing PHC string with a fresh salt.
///
/// # Errors
/// - Returns `InvalidInput` for an empty secret or invalid parameters
/// - Returns `Crypto` if hashing fails
pub fn hash_secret(secret: &[u8], params: &VerifierParams) -> Result<String> {
    if secret.is_empty() {
        return Err(Error::InvalidInput("Secret cannot be empty".to_string()));
    }
    let argon2 = params.build()?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(secret, &salt)
        .map_err(|e| Error::Crypto(format!("Credential hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

/// Check a secret against a stored PHC string.
///
/// Returns `Ok(false)` on mismatch. The comparison inside argon2 is
/// constant time.
///
/// # Errors
/// - Returns `Crypto` if the stored verifier is malformed
pub fn verify_secret(secret: &[u8], phc: &str) -> Result<bool> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| Error::Crypto(format!("Malformed credential verifier: {}", e)))?;
    match Argon2::default().verify_password(secret, &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(Error::Crypto(format!("Credential verification failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let params = VerifierParams::insecure_fast();
        let phc = hash_secret(b"correct horse", &params).unwrap();

        assert!(phc.starts_with("$argon2id$"));
        assert!(verify_secret(b"correct horse", &phc).unwrap());
        assert!(!verify_secret(b"wrong horse", &phc).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let params = VerifierParams::insecure_fast();
        let a = hash_secret(b"same", &params).unwrap();
        let b = hash_secret(b"same", &params).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_verifier_errors() {
        assert!(verify_secret(b"x", "not-a-phc-string").is_err());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = VerifierParams {
            memory_cost: 1,
            time_cost: 0,
            parallelism: 1,
        };
        assert!(params.validate().is_err());
    }
}
