//! Engine-wide configuration.
//!
//! One JSON document composes the settings of every subsystem. Every field
//! has a default, so an empty object is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use veilvault_common::{Error, Result};
use veilvault_crypto::CryptoConfig;
use veilvault_security::SecurityConfig;
use veilvault_vault::VaultConfig;

/// Rules applied when profiles are created or their credentials change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilePolicy {
    /// Minimum master key length in characters.
    pub min_master_key_length: usize,
    /// Only an elevated process may create profiles.
    pub admin_only_creation: bool,
}

impl Default for ProfilePolicy {
    fn default() -> Self {
        Self {
            min_master_key_length: 4,
            admin_only_creation: false,
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub crypto: CryptoConfig,
    pub security: SecurityConfig,
    pub vault: VaultConfig,
    pub profile: ProfilePolicy,
}

impl EngineConfig {
    /// Check every section.
    ///
    /// # Errors
    /// - `InvalidInput` naming the first offending setting
    pub fn validate(&self) -> Result<()> {
        self.crypto.validate()?;
        self.security.validate()?;
        self.vault.validate()?;
        if self.profile.min_master_key_length == 0 {
            return Err(Error::InvalidInput(
                "min_master_key_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    ///
    /// # Errors
    /// - I/O errors reading `path`
    /// - `Serialization` for malformed JSON
    /// - `InvalidInput` if validation fails
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
