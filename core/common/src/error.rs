//! Common error types for VeilVault.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for VeilVault operations.
///
/// Variants carry technical detail for logs only. User-facing text is
/// produced by the security subsystem from [`ErrorKind`].
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Startup self-test of the encryption engine failed.
    #[error("Self-test failed: {0}")]
    SelfTest(String),

    /// Vault operation failed.
    #[error("Vault error: {0}")]
    Vault(String),

    /// Stored checksums do not match vault content.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Content could not be recovered after corruption.
    #[error("Data loss: {0}")]
    DataLoss(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Caller lacks the platform rights the operation needs.
    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Credential did not verify.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Identifier is blocked by the rate limiter.
    #[error("Rate limited: {0}")]
    RateLimited(String),
}

impl Error {
    /// Machine-readable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::SelfTest(_) => ErrorKind::SelfTest,
            Error::Vault(_) => ErrorKind::Vault,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::DataLoss(_) => ErrorKind::DataLoss,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotPermitted(_) => ErrorKind::NotPermitted,
            Error::Privilege(_) => ErrorKind::Privilege,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::RateLimited(_) => ErrorKind::RateLimited,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Machine-readable error classification carried across the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Crypto,
    SelfTest,
    Vault,
    Integrity,
    DataLoss,
    Io,
    Serialization,
    InvalidInput,
    NotPermitted,
    Privilege,
    NotFound,
    AlreadyExists,
    Authentication,
    RateLimited,
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
