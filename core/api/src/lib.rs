//! Transport boundary for the VeilVault engine.
//!
//! Every profile, folder, vault-maintenance and audit operation is a
//! [`Request`] variant; every call returns a [`Response`] with an explicit
//! success flag. Failures carry a machine-readable kind and a fixed
//! user-facing message, never internal detail.

pub mod engine;
pub mod request;
pub mod response;

pub use engine::{Engine, EVENT_LOG_FILE, EXPORTS_DIR, LOG_DIR, PROFILES_DIR, VAULTS_DIR};
pub use request::Request;
pub use response::{AuditExported, MasterKeyRecovered, PasswordChanged, ProfileCreated, Response};
