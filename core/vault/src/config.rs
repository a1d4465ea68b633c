//! Vault handler policy.

use serde::{Deserialize, Serialize};

use veilvault_common::{Error, Result};

/// How the original location is dealt with once its content is vaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HideStrategy {
    /// Remove when permitted, otherwise fall back to a placeholder.
    #[default]
    Auto,
    /// Always remove; fail if the platform does not allow it.
    Remove,
    /// Always leave an empty, locked-down placeholder directory.
    Placeholder,
}

/// Vault handler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Overwrite passes used by secure deletion (zeros, ones, random, ...).
    pub overwrite_passes: u32,
    pub hide_strategy: HideStrategy,
    /// Refresh the vault-level snapshot after every change to vault content.
    pub snapshot_on_change: bool,
    /// Scoped backups older than this are removed when a vault is opened.
    pub backup_retention_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            overwrite_passes: 3,
            hide_strategy: HideStrategy::Auto,
            snapshot_on_change: true,
            backup_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl VaultConfig {
    pub fn validate(&self) -> Result<()> {
        if self.overwrite_passes == 0 || self.overwrite_passes > 35 {
            return Err(Error::InvalidInput(
                "overwrite_passes must be between 1 and 35".to_string(),
            ));
        }
        Ok(())
    }
}
