//! Common types used throughout VeilVault.

use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MAX_ID_LEN: usize = 64;

/// Identifiers double as directory and file names, so they are limited to
/// a conservative character set.
fn validate_component(kind: &str, id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} cannot be empty", kind)));
    }
    if id.len() > MAX_ID_LEN {
        return Err(crate::Error::InvalidInput(format!(
            "{} longer than {} characters",
            kind, MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::Error::InvalidInput(format!(
            "{} contains invalid characters",
            kind
        )));
    }
    Ok(())
}

/// Unique identifier for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a ProfileId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty, at most 64 characters of `[A-Za-z0-9_-]`
    ///
    /// # Errors
    /// - Returns `InvalidInput` if the id is not a safe path component
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_component("ProfileId", &id)?;
        Ok(Self(id))
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProfileId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VaultId(String);

impl VaultId {
    /// Create a new VaultId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or not a safe path component
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_component("VaultId", &id)?;
        Ok(Self(id))
    }

    /// The vault owned by a profile. There is exactly one per profile.
    pub fn for_profile(profile_id: &ProfileId) -> Self {
        Self(profile_id.as_str().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VaultId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<VaultId> for String {
    fn from(id: VaultId) -> Self {
        id.0
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a vaulted folder, derived from its original path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FolderId(String);

impl FolderId {
    /// Create a FolderId from a string.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_component("FolderId", &id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FolderId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<FolderId> for String {
    fn from(id: FolderId) -> Self {
        id.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user secret (master key or recovery key text) that zeroizes on drop.
///
/// Deserializes from a plain string so request secrets never pass through
/// an intermediate `String` owned by the caller.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    /// Wrap a secret string.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the secret text.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Get the secret as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Passphrase {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl PartialEq for Passphrase {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for Passphrase {}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passphrase([REDACTED])")
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_id_creation() {
        let id = ProfileId::new("ops_team-1").unwrap();
        assert_eq!(id.as_str(), "ops_team-1");
    }

    #[test]
    fn test_profile_id_rejects_path_tricks() {
        assert!(ProfileId::new("").is_err());
        assert!(ProfileId::new("../etc").is_err());
        assert!(ProfileId::new("a/b").is_err());
        assert!(ProfileId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_generated_profile_ids_differ() {
        let a = ProfileId::generate();
        let b = ProfileId::generate();
        assert_ne!(a, b);
        assert!(ProfileId::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_vault_id_for_profile() {
        let profile = ProfileId::new("abc").unwrap();
        assert_eq!(VaultId::for_profile(&profile).as_str(), "abc");
    }

    #[test]
    fn test_ids_deserialize_with_validation() {
        let ok: FolderId = serde_json::from_str("\"0a1b2c\"").unwrap();
        assert_eq!(ok.as_str(), "0a1b2c");
        let bad: std::result::Result<FolderId, _> = serde_json::from_str("\"../x\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_passphrase_debug_redacted() {
        let p = Passphrase::new("hunter2");
        assert_eq!(format!("{:?}", p), "Passphrase([REDACTED])");
        assert_eq!(p.char_len(), 7);
        assert_eq!(p, Passphrase::from("hunter2"));
        assert_ne!(p, Passphrase::from("hunter3"));
    }

    #[test]
    fn test_passphrase_deserializes_from_string() {
        let p: Passphrase = serde_json::from_str("\"M1-key\"").unwrap();
        assert_eq!(p.expose(), "M1-key");
    }
}
