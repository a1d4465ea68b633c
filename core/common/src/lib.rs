//! Common utilities and types shared across VeilVault modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, ErrorKind, Result};
pub use types::{FolderId, Passphrase, ProfileId, SensitiveBytes, VaultId};
