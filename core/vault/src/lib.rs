//! Folder vault handler for VeilVault.
//!
//! This module provides:
//! - Profile-scoped vault directory structure and manifest
//! - Hiding folders into a vault as encrypted content with full metadata
//! - Restoring folders with their ownership, permissions, timestamps and
//!   extended attributes
//! - Key rotation, relocking and multi-pass secure deletion
//!
//! # Architecture
//! The handler sits between the profile manager and the filesystem. It
//! receives master keys per call and never persists them; all content
//! passes through the encryption engine and every destructive step is
//! covered by a scoped backup.

pub mod config;
pub mod handler;
pub mod metadata;
pub mod platform;
pub mod shred;
pub mod structure;

pub use config::{HideStrategy, VaultConfig};
pub use handler::{CleanupResult, HideResult, RestoreResult, VaultHandler};
pub use metadata::{FolderMetadata, HideMethod, PreservedMetadata};
pub use platform::{NativePlatform, Platform};
pub use structure::{read_json, write_json_atomic, VaultLayout, VaultStructure, VaultVersion};
