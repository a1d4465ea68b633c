//! Requests accepted at the transport boundary.
//!
//! Each request is a JSON object whose `op` field names the operation, for
//! example `{"op": "lock_folder", "profile_id": "...", "master_key": "...",
//! "path": "/home/user/private"}`. Secrets deserialize straight into
//! zeroizing [`Passphrase`] values.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use veilvault_common::{FolderId, Passphrase, ProfileId};
use veilvault_profile::{IntakeMode, UnlockMode};
use veilvault_security::{EventFilter, SecurityEventType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // Profiles
    CreateProfile {
        name: String,
        master_key: Passphrase,
    },
    ListProfiles,
    GetProfile {
        profile_id: ProfileId,
    },
    DeleteProfile {
        profile_id: ProfileId,
        master_key: Passphrase,
    },
    AuthenticateProfile {
        profile_id: ProfileId,
        master_key: Passphrase,
    },
    VerifyMasterKey {
        profile_id: ProfileId,
        master_key: Passphrase,
    },
    GetProfileIdFromRecoveryKey {
        recovery_key: Passphrase,
    },
    RecoverMasterKey {
        recovery_key: Passphrase,
    },
    ChangeProfilePassword {
        profile_id: ProfileId,
        old_master_key: Passphrase,
        new_master_key: Passphrase,
    },
    RetryFolderReencryption {
        profile_id: ProfileId,
        master_key: Passphrase,
    },
    SetActiveProfile {
        profile_id: ProfileId,
    },
    GetActiveProfile,
    ClearActiveProfile,

    // Folders
    LockFolder {
        profile_id: ProfileId,
        master_key: Passphrase,
        path: PathBuf,
    },
    UnlockFolders {
        profile_id: ProfileId,
        master_key: Passphrase,
        mode: UnlockMode,
    },
    UnlockFolder {
        profile_id: ProfileId,
        master_key: Passphrase,
        folder_id: FolderId,
        mode: UnlockMode,
    },
    RelockFolders {
        profile_id: ProfileId,
        master_key: Passphrase,
    },
    RemoveFolder {
        profile_id: ProfileId,
        master_key: Passphrase,
        folder_id: FolderId,
    },
    ListFolders {
        profile_id: ProfileId,
    },
    CandidateSecret {
        #[serde(default)]
        profile_id: Option<ProfileId>,
        raw_text: Passphrase,
        mode: IntakeMode,
    },

    // Vault maintenance
    GetVaultStructure {
        profile_id: ProfileId,
    },
    ListVaultFolders {
        profile_id: ProfileId,
    },
    ValidateVaultIntegrity {
        profile_id: ProfileId,
    },
    AttemptVaultRecovery {
        profile_id: ProfileId,
    },
    CleanupTempArea {
        profile_id: ProfileId,
    },
    SnapshotVault {
        profile_id: ProfileId,
    },
    PreserveFolderMetadata {
        path: PathBuf,
    },
    RequiresElevatedPrivileges {
        path: PathBuf,
    },

    // Security audit
    SecurityEvents {
        #[serde(default)]
        filter: EventFilter,
    },
    EventStatistics {
        #[serde(default)]
        filter: EventFilter,
    },
    /// Written to `exports/<file_name>` under the data directory.
    ExportAuditLog {
        file_name: String,
        #[serde(default)]
        filter: EventFilter,
    },
    RateLimitInfo {
        identifier: String,
    },
    GetSecureErrorMessage {
        event_type: SecurityEventType,
    },
}

impl Request {
    /// Operation name for logs. Never includes parameters.
    pub fn op(&self) -> &'static str {
        match self {
            Request::CreateProfile { .. } => "create_profile",
            Request::ListProfiles => "list_profiles",
            Request::GetProfile { .. } => "get_profile",
            Request::DeleteProfile { .. } => "delete_profile",
            Request::AuthenticateProfile { .. } => "authenticate_profile",
            Request::VerifyMasterKey { .. } => "verify_master_key",
            Request::GetProfileIdFromRecoveryKey { .. } => "get_profile_id_from_recovery_key",
            Request::RecoverMasterKey { .. } => "recover_master_key",
            Request::ChangeProfilePassword { .. } => "change_profile_password",
            Request::RetryFolderReencryption { .. } => "retry_folder_reencryption",
            Request::SetActiveProfile { .. } => "set_active_profile",
            Request::GetActiveProfile => "get_active_profile",
            Request::ClearActiveProfile => "clear_active_profile",
            Request::LockFolder { .. } => "lock_folder",
            Request::UnlockFolders { .. } => "unlock_folders",
            Request::UnlockFolder { .. } => "unlock_folder",
            Request::RelockFolders { .. } => "relock_folders",
            Request::RemoveFolder { .. } => "remove_folder",
            Request::ListFolders { .. } => "list_folders",
            Request::CandidateSecret { .. } => "candidate_secret",
            Request::GetVaultStructure { .. } => "get_vault_structure",
            Request::ListVaultFolders { .. } => "list_vault_folders",
            Request::ValidateVaultIntegrity { .. } => "validate_vault_integrity",
            Request::AttemptVaultRecovery { .. } => "attempt_vault_recovery",
            Request::CleanupTempArea { .. } => "cleanup_temp_area",
            Request::SnapshotVault { .. } => "snapshot_vault",
            Request::PreserveFolderMetadata { .. } => "preserve_folder_metadata",
            Request::RequiresElevatedPrivileges { .. } => "requires_elevated_privileges",
            Request::SecurityEvents { .. } => "security_events",
            Request::EventStatistics { .. } => "event_statistics",
            Request::ExportAuditLog { .. } => "export_audit_log",
            Request::RateLimitInfo { .. } => "rate_limit_info",
            Request::GetSecureErrorMessage { .. } => "get_secure_error_message",
        }
    }
}
