//! Profile management for VeilVault.
//!
//! A profile is the credential root for one vault: a master key verifier,
//! a recovery key verifier, and the two secrets sealed under each other so
//! that either one recovers the other. The [`ProfileManager`] authenticates
//! every folder operation, keeps the list of folders a profile owns, and
//! hands the master key to the vault handler for the duration of one call.
//!
//! Secrets captured outside the engine enter through
//! [`ProfileManager::on_candidate_secret_detected`].

pub mod config;
pub mod intake;
pub mod manager;
pub mod record;
pub mod recovery_key;

pub use config::{EngineConfig, ProfilePolicy};
pub use intake::{IntakeMode, IntakeOutcome};
pub use manager::{
    CreatedProfile, FolderFailure, PasswordChange, ProfileManager, RelockSummary, RotationReport,
    UnlockMode, UnlockResult, UnlockSummary,
};
pub use record::{FolderState, FolderSummary, ProfileSummary};
pub use recovery_key::RecoveryKey;
