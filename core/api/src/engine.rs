//! The assembled engine behind the transport boundary.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::request::Request;
use crate::response::{
    AuditExported, MasterKeyRecovered, PasswordChanged, ProfileCreated, Response,
};
use veilvault_common::{Clock, Error, ProfileId, Result, SystemClock, VaultId};
use veilvault_crypto::EncryptionEngine;
use veilvault_profile::{EngineConfig, ProfileManager};
use veilvault_security::backup::create_private_dir;
use veilvault_security::{secure_error_message, SecurityMonitor};
use veilvault_vault::VaultHandler;

pub const PROFILES_DIR: &str = "profiles";
pub const VAULTS_DIR: &str = "vaults";
pub const LOG_DIR: &str = "logs";
pub const EVENT_LOG_FILE: &str = "security_events.jsonl";
pub const EXPORTS_DIR: &str = "exports";

/// One engine per data directory.
pub struct Engine {
    data_dir: PathBuf,
    config: EngineConfig,
    manager: ProfileManager,
}

impl Engine {
    /// Open the engine over `data_dir`.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid configuration
    /// - `SelfTest` if the encryption engine fails its startup checks
    pub fn open(data_dir: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        Self::with_clock(data_dir, config, Arc::new(SystemClock))
    }

    /// Open with an explicit clock.
    pub fn with_clock(
        data_dir: impl Into<PathBuf>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let data_dir = data_dir.into();
        create_private_dir(&data_dir)?;

        let crypto = Arc::new(EncryptionEngine::new(config.crypto.clone())?);
        let security = Arc::new(SecurityMonitor::new(
            config.security.clone(),
            &data_dir.join(LOG_DIR).join(EVENT_LOG_FILE),
            clock,
        )?);
        let vaults = Arc::new(VaultHandler::new(
            data_dir.join(VAULTS_DIR),
            Arc::clone(&crypto),
            Arc::clone(&security),
            config.vault.clone(),
        )?);
        let manager = ProfileManager::new(
            data_dir.join(PROFILES_DIR),
            crypto,
            security,
            vaults,
            config.profile.clone(),
        )?;

        info!(data_dir = %data_dir.display(), "Engine ready");
        Ok(Self {
            data_dir,
            config,
            manager,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &ProfileManager {
        &self.manager
    }

    /// Where an audit export named `file_name` is written. Only a plain
    /// file name is accepted; exports never leave the data directory.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty name or one with path components
    fn export_path(&self, file_name: &str) -> Result<PathBuf> {
        let mut components = Path::new(file_name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain || file_name.contains(['/', '\\']) {
            return Err(Error::InvalidInput(format!(
                "Export name must be a plain file name: {}",
                file_name
            )));
        }
        let dir = self.data_dir.join(EXPORTS_DIR);
        create_private_dir(&dir)?;
        Ok(dir.join(file_name))
    }

    /// Write buffered security events to disk.
    pub fn flush(&self) -> Result<()> {
        self.manager.security().flush()
    }

    /// Execute one request.
    pub fn handle(&self, request: Request) -> Response {
        let op = request.op();
        match self.dispatch(request) {
            Ok(payload) => {
                debug!(op, "Request completed");
                Response::ok(payload)
            }
            Err(e) => {
                warn!(op, kind = ?e.kind(), "Request failed");
                debug!(op, error = %e, "Request failure detail");
                Response::from_error(&e)
            }
        }
    }

    /// Parse and execute a JSON request, returning a JSON response.
    pub fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<Request>(request) {
            Ok(request) => self.handle(request),
            Err(e) => {
                debug!(error = %e, "Unparseable request");
                Response::failure(veilvault_common::ErrorKind::InvalidInput)
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"success":false,"errorKind":"serialization"}"#.to_string()
        })
    }

    fn dispatch(&self, request: Request) -> Result<Value> {
        let manager = &self.manager;
        let vaults = manager.vaults();
        let security = manager.security();

        match request {
            Request::CreateProfile { name, master_key } => {
                let created = manager.create_profile(&name, &master_key)?;
                payload(&ProfileCreated {
                    profile_id: created.profile_id.clone(),
                    recovery_key: created.recovery_key.expose().to_string(),
                })
            }
            Request::ListProfiles => payload(&manager.list_profiles()?),
            Request::GetProfile { profile_id } => payload(&manager.get_profile(&profile_id)?),
            Request::DeleteProfile {
                profile_id,
                master_key,
            } => {
                manager.delete_profile(&profile_id, &master_key)?;
                payload(&true)
            }
            Request::AuthenticateProfile {
                profile_id,
                master_key,
            } => payload(&manager.authenticate_profile(&profile_id, &master_key)?),
            Request::VerifyMasterKey {
                profile_id,
                master_key,
            } => payload(&manager.verify_master_key(&profile_id, &master_key)?),
            Request::GetProfileIdFromRecoveryKey { recovery_key } => {
                payload(&manager.get_profile_id_from_recovery_key(recovery_key.expose())?)
            }
            Request::RecoverMasterKey { recovery_key } => {
                let (profile_id, master) =
                    manager.recover_master_key_from_recovery_key(recovery_key.expose())?;
                payload(&MasterKeyRecovered {
                    profile_id,
                    master_key: master.expose().to_string(),
                })
            }
            Request::ChangeProfilePassword {
                profile_id,
                old_master_key,
                new_master_key,
            } => {
                let change =
                    manager.change_profile_password(&profile_id, &old_master_key, &new_master_key)?;
                payload(&PasswordChanged {
                    recovery_key: change.recovery_key.expose().to_string(),
                    rotation: change.rotation.clone(),
                })
            }
            Request::RetryFolderReencryption {
                profile_id,
                master_key,
            } => payload(&manager.retry_folder_reencryption(&profile_id, &master_key)?),
            Request::SetActiveProfile { profile_id } => {
                manager.set_active_profile(&profile_id)?;
                payload(&profile_id)
            }
            Request::GetActiveProfile => payload(&manager.active_profile()),
            Request::ClearActiveProfile => {
                manager.clear_active_profile();
                payload(&true)
            }

            Request::LockFolder {
                profile_id,
                master_key,
                path,
            } => payload(&manager.lock_folder(&profile_id, &master_key, &path)?),
            Request::UnlockFolders {
                profile_id,
                master_key,
                mode,
            } => payload(&manager.unlock_folders(&profile_id, &master_key, mode)?),
            Request::UnlockFolder {
                profile_id,
                master_key,
                folder_id,
                mode,
            } => payload(&manager.unlock_folder(&profile_id, &master_key, &folder_id, mode)?),
            Request::RelockFolders {
                profile_id,
                master_key,
            } => payload(&manager.relock_folders(&profile_id, &master_key)?),
            Request::RemoveFolder {
                profile_id,
                master_key,
                folder_id,
            } => payload(&manager.remove_folder(&profile_id, &master_key, &folder_id)?),
            Request::ListFolders { profile_id } => payload(&manager.list_folders(&profile_id)?),
            Request::CandidateSecret {
                profile_id,
                raw_text,
                mode,
            } => payload(&manager.on_candidate_secret_detected(
                profile_id.as_ref(),
                raw_text,
                mode,
            )?),

            Request::GetVaultStructure { profile_id } => {
                payload(&vaults.get_vault_structure(&VaultId::for_profile(&profile_id))?)
            }
            Request::ListVaultFolders { profile_id } => {
                payload(&vaults.list_vault_folders(&VaultId::for_profile(&profile_id))?)
            }
            Request::ValidateVaultIntegrity { profile_id } => {
                payload(&manager.validate_vault_integrity(&profile_id)?)
            }
            Request::AttemptVaultRecovery { profile_id } => {
                payload(&manager.attempt_vault_recovery(&profile_id)?)
            }
            Request::CleanupTempArea { profile_id } => {
                payload(&manager.cleanup_temp_area(&profile_id)?)
            }
            Request::SnapshotVault { profile_id } => {
                payload(&manager.snapshot_vault(&profile_id)?)
            }
            Request::PreserveFolderMetadata { path } => {
                payload(&vaults.preserve_folder_metadata(&path)?)
            }
            Request::RequiresElevatedPrivileges { path } => {
                payload(&vaults.requires_elevated_privileges(&path))
            }

            Request::SecurityEvents { filter } => payload(&security.security_events(&filter)),
            Request::EventStatistics { filter } => payload(&security.event_statistics(&filter)),
            Request::ExportAuditLog { file_name, filter } => {
                let path = self.export_path(&file_name)?;
                let events = security.export_audit_log(&path, &filter)?;
                payload(&AuditExported { path, events })
            }
            Request::RateLimitInfo { identifier } => {
                payload(&security.rate_limit_info(&identifier))
            }
            Request::GetSecureErrorMessage { event_type } => {
                payload(&secure_error_message(event_type))
            }
        }
    }
}

fn payload<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
