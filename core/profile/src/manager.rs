//! Profile lifecycle and per-profile folder orchestration.
//!
//! The manager owns profile records and decides which folders a profile
//! has locked. It authenticates every folder operation against the stored
//! verifier, passes the master key through to the vault handler for the
//! duration of one call, and serializes all work on a profile behind that
//! profile's own lock.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProfilePolicy;
use crate::record::{
    FolderEntry, FolderState, FolderSummary, ProfileRecord, ProfileStore, ProfileSummary,
};
use crate::recovery_key::RecoveryKey;
use veilvault_common::{
    Clock, Error, ErrorKind, FolderId, Passphrase, ProfileId, Result, VaultId,
};
use veilvault_crypto::{EncryptionEngine, KeyPurpose, SealedSecret};
use veilvault_security::{NewEvent, RecoveryReport, SecurityEventType, SecurityMonitor, Severity};
use veilvault_vault::metadata::folder_id_for;
use veilvault_vault::{HideResult, VaultHandler};

const COMPONENT: &str = "profile_manager";
const MAX_NAME_CHARS: usize = 64;

/// Rate-limit identifier shared by all recovery-key lookups.
pub const RECOVERY_IDENTIFIER: &str = "recovery";

/// What happens to the vault copy when a folder is unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMode {
    /// Restore the folder and keep the vault copy for relocking.
    Temporary,
    /// Restore the folder, then securely delete the vault copy.
    Permanent,
}

/// A newly created profile. The recovery key is never retrievable again.
#[derive(Debug)]
pub struct CreatedProfile {
    pub profile_id: ProfileId,
    pub recovery_key: RecoveryKey,
}

/// One folder an operation could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderFailure {
    pub folder_id: FolderId,
    pub error_kind: ErrorKind,
}

/// Which vault copies moved to the current master key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub reencrypted: Vec<FolderId>,
    /// Folders still under their previous key; retried on the next unlock
    /// or an explicit retry.
    pub failed: Vec<FolderFailure>,
}

/// Result of a password change.
#[derive(Debug)]
pub struct PasswordChange {
    /// Replaces the previous recovery key, which no longer works.
    pub recovery_key: RecoveryKey,
    pub rotation: RotationReport,
}

/// Outcome of unlocking one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockResult {
    pub folder_id: FolderId,
    pub restored_path: PathBuf,
    pub mode: UnlockMode,
    pub metadata_restored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<String>,
    /// Vault bytes overwritten by a permanent unlock.
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockSummary {
    pub unlocked: Vec<UnlockResult>,
    pub failed: Vec<FolderFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelockSummary {
    pub relocked: Vec<FolderId>,
    pub failed: Vec<FolderFailure>,
}

/// Creates, authenticates and maintains profiles.
pub struct ProfileManager {
    pub(crate) store: ProfileStore,
    pub(crate) engine: Arc<EncryptionEngine>,
    pub(crate) security: Arc<SecurityMonitor>,
    vaults: Arc<VaultHandler>,
    policy: ProfilePolicy,
    locks: DashMap<ProfileId, Arc<Mutex<()>>>,
    creation: Mutex<()>,
    active: RwLock<Option<ProfileId>>,
}

impl ProfileManager {
    /// Open the manager over the profile records in `profiles_dir`.
    pub fn new(
        profiles_dir: impl Into<PathBuf>,
        engine: Arc<EncryptionEngine>,
        security: Arc<SecurityMonitor>,
        vaults: Arc<VaultHandler>,
        policy: ProfilePolicy,
    ) -> Result<Self> {
        let store = ProfileStore::open(profiles_dir, vaults.config().overwrite_passes)?;
        Ok(Self {
            store,
            engine,
            security,
            vaults,
            policy,
            locks: DashMap::new(),
            creation: Mutex::new(()),
            active: RwLock::new(None),
        })
    }

    pub fn security(&self) -> &Arc<SecurityMonitor> {
        &self.security
    }

    pub fn vaults(&self) -> &Arc<VaultHandler> {
        &self.vaults
    }

    pub fn policy(&self) -> &ProfilePolicy {
        &self.policy
    }

    /// The lock serializing work on `id`. Ids with no stored profile get a
    /// throwaway lock so unknown ids never accumulate in the map.
    fn profile_lock(&self, id: &ProfileId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(id) {
            return lock.clone();
        }
        if !self.store.exists(id) {
            return Arc::default();
        }
        self.locks.entry(id.clone()).or_default().clone()
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.security.clock().now()
    }

    fn is_active(&self, id: &ProfileId) -> bool {
        self.active.read().as_ref() == Some(id)
    }

    fn check_master_key_policy(&self, master: &Passphrase) -> Result<()> {
        let min = self.policy.min_master_key_length;
        if master.char_len() < min {
            return Err(Error::InvalidInput(format!(
                "Master key must be at least {} characters",
                min
            )));
        }
        Ok(())
    }

    /// Whether creating a profile is refused for the current process.
    pub fn requires_elevation_for_creation(&self) -> bool {
        self.policy.admin_only_creation && !self.vaults.platform().is_elevated()
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    /// Create a profile and its vault.
    ///
    /// # Postconditions
    /// - The record holds only verifiers and the two cross-sealed secrets
    /// - The vault directory structure exists
    ///
    /// # Errors
    /// - `InvalidInput` for an empty or overlong name or a short master key
    /// - `AlreadyExists` if another profile has the same name
    /// - `Privilege` when creation is restricted to administrators
    pub fn create_profile(&self, name: &str, master: &Passphrase) -> Result<CreatedProfile> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("Profile name cannot be empty".to_string()));
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(Error::InvalidInput(format!(
                "Profile name longer than {} characters",
                MAX_NAME_CHARS
            )));
        }
        self.check_master_key_policy(master)?;
        if self.requires_elevation_for_creation() {
            self.security.log_security_event(
                NewEvent::new(SecurityEventType::PrivilegeEscalation, Severity::Warning, COMPONENT)
                    .description("Profile creation refused without administrative rights"),
            );
            return Err(Error::Privilege(
                "Administrative rights are required to create profiles".to_string(),
            ));
        }

        let _creating = self.creation.lock();
        if self.store.list()?.iter().any(|r| r.name == name) {
            return Err(Error::AlreadyExists(format!("Profile name in use: {}", name)));
        }

        let id = ProfileId::generate();
        let recovery_key = RecoveryKey::generate();
        let recovery = recovery_key.to_passphrase();
        let record = ProfileRecord {
            id: id.clone(),
            name: name.to_string(),
            master_key_hash: self.engine.hash_credential(master)?,
            recovery_key_hash: self.engine.hash_credential(&recovery)?,
            encrypted_recovery_key: self.engine.seal(
                recovery.as_bytes(),
                master,
                KeyPurpose::RecoveryKeyWrap,
            )?,
            master_key_encrypted_with_recovery_key: self.engine.seal(
                master.as_bytes(),
                &recovery,
                KeyPurpose::MasterKeyWrap,
            )?,
            created_at: self.now(),
            last_access: None,
            folders: Vec::new(),
        };

        self.vaults
            .create_vault_structure(&VaultId::for_profile(&id), &id)?;
        self.store.save(&record)?;

        info!(profile_id = %id, "Profile created");
        Ok(CreatedProfile {
            profile_id: id,
            recovery_key,
        })
    }

    /// All profiles, oldest first.
    pub fn list_profiles(&self) -> Result<Vec<ProfileSummary>> {
        Ok(self
            .store
            .list()?
            .iter()
            .map(|r| r.summary(self.is_active(&r.id)))
            .collect())
    }

    /// # Errors
    /// - `NotFound` for an unknown profile
    pub fn get_profile(&self, id: &ProfileId) -> Result<ProfileSummary> {
        let record = self.store.load(id)?;
        Ok(record.summary(self.is_active(id)))
    }

    /// Delete a profile, its vault and its record.
    ///
    /// Temporarily unlocked folders stay where they are; only their vault
    /// copies are destroyed.
    ///
    /// # Errors
    /// - `NotPermitted` while any folder is still locked
    pub fn delete_profile(&self, id: &ProfileId, master: &Passphrase) -> Result<()> {
        {
            let lock = self.profile_lock(id);
            let _guard = lock.lock();
            let record = self.authorize(id, master)?;
            if record.has_locked_folders() {
                return Err(Error::NotPermitted(
                    "Unlock all folders before deleting the profile".to_string(),
                ));
            }

            match self.vaults.delete_vault(&VaultId::for_profile(id)) {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            self.store.delete(id)?;
            self.security.reset_rate_limit(id.as_str());

            let mut active = self.active.write();
            if active.as_ref() == Some(id) {
                *active = None;
            }
        }
        self.locks.remove(id);
        info!(profile_id = %id, "Profile deleted");
        Ok(())
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Count the attempt, verify the master key and load the record.
    ///
    /// Callers hold the profile lock.
    pub(crate) fn authorize(&self, id: &ProfileId, master: &Passphrase) -> Result<ProfileRecord> {
        if !self.security.check_profile_rate_limit(id) {
            return Err(Error::RateLimited(format!("Profile blocked: {}", id)));
        }

        let mut record = match self.store.load(id) {
            Ok(record) => record,
            Err(Error::NotFound(_)) => {
                self.security
                    .handle_authentication_failure(Some(id), COMPONENT, "Unknown profile");
                return Err(Error::Authentication("Unknown profile".to_string()));
            }
            Err(e) => return Err(e),
        };

        if !self.engine.verify_credential(master, &record.master_key_hash)? {
            self.security
                .handle_authentication_failure(Some(id), COMPONENT, "Master key mismatch");
            return Err(Error::Authentication("Master key mismatch".to_string()));
        }

        self.security.reset_rate_limit(id.as_str());
        record.last_access = Some(self.now());
        self.store.save(&record)?;
        debug!(profile_id = %id, "Profile authenticated");
        Ok(record)
    }

    /// Check a master key against the stored verifier.
    ///
    /// Every attempt counts against the profile's rate limit, including
    /// attempts with the correct key while the profile is blocked.
    ///
    /// # Errors
    /// - `RateLimited` while blocked
    /// - `Authentication` for a wrong key or unknown profile
    pub fn authenticate_profile(
        &self,
        id: &ProfileId,
        master: &Passphrase,
    ) -> Result<ProfileSummary> {
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        let record = self.authorize(id, master)?;
        Ok(record.summary(self.is_active(id)))
    }

    /// Like [`authenticate_profile`](Self::authenticate_profile) but a
    /// wrong key is `Ok(false)`.
    pub fn verify_master_key(&self, id: &ProfileId, master: &Passphrase) -> Result<bool> {
        match self.authenticate_profile(id, master) {
            Ok(_) => Ok(true),
            Err(Error::Authentication(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Find the profile a recovery key belongs to.
    ///
    /// # Errors
    /// - `RateLimited` after too many failed lookups
    /// - `NotFound` for a malformed key or a key matching no profile, with
    ///   no indication of which
    pub fn get_profile_id_from_recovery_key(&self, recovery_key: &str) -> Result<ProfileId> {
        if !self.security.check_default_rate_limit(RECOVERY_IDENTIFIER) {
            return Err(Error::RateLimited("Recovery attempts blocked".to_string()));
        }
        let not_found = || Error::NotFound("No profile matches the recovery key".to_string());

        let key = match RecoveryKey::parse(recovery_key) {
            Ok(key) => key,
            Err(_) => {
                self.security.handle_failed_attempt(
                    RECOVERY_IDENTIFIER,
                    None,
                    COMPONENT,
                    "Malformed recovery key",
                );
                return Err(not_found());
            }
        };

        let candidate = key.to_passphrase();
        for record in self.store.list()? {
            if self
                .engine
                .verify_credential(&candidate, &record.recovery_key_hash)?
            {
                self.security.reset_rate_limit(RECOVERY_IDENTIFIER);
                return Ok(record.id);
            }
        }

        self.security.handle_failed_attempt(
            RECOVERY_IDENTIFIER,
            None,
            COMPONENT,
            "Recovery key matched no profile",
        );
        Err(not_found())
    }

    /// Recover the current master key of the profile a recovery key
    /// belongs to.
    ///
    /// # Errors
    /// - As [`get_profile_id_from_recovery_key`](Self::get_profile_id_from_recovery_key)
    /// - `Crypto` if the sealed master key does not open
    pub fn recover_master_key_from_recovery_key(
        &self,
        recovery_key: &str,
    ) -> Result<(ProfileId, Passphrase)> {
        let id = self.get_profile_id_from_recovery_key(recovery_key)?;
        let key = RecoveryKey::parse(recovery_key)?;
        let record = self.store.load(&id)?;
        match self.unseal_text(&record.master_key_encrypted_with_recovery_key, &key.to_passphrase()) {
            Ok(master) => {
                info!(profile_id = %id, "Master key recovered");
                Ok((id, master))
            }
            Err(e) => {
                self.security
                    .handle_encryption_error(Some(&id), "recover_master_key", &e.to_string());
                Err(e)
            }
        }
    }

    /// Replace the master key and issue a new recovery key.
    ///
    /// New credentials are written first, scrubbing the old record, so the
    /// previous recovery key stops working immediately. Every vault copy is
    /// then rotated under the new key; folders that fail keep their old
    /// ciphertext together with the old key sealed under the new one.
    ///
    /// # Errors
    /// - `InvalidInput` if the new key violates the policy
    /// - Authentication errors for the old key
    pub fn change_profile_password(
        &self,
        id: &ProfileId,
        old_master: &Passphrase,
        new_master: &Passphrase,
    ) -> Result<PasswordChange> {
        self.check_master_key_policy(new_master)?;
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        let mut record = self.authorize(id, old_master)?;

        for entry in record.folders.iter_mut() {
            let previous = match &entry.legacy_key {
                Some(sealed) => self.unseal_text(sealed, old_master)?,
                None => old_master.clone(),
            };
            entry.legacy_key = Some(self.engine.seal(
                previous.as_bytes(),
                new_master,
                KeyPurpose::LegacyKeyWrap,
            )?);
        }

        let recovery_key = RecoveryKey::generate();
        let recovery = recovery_key.to_passphrase();
        record.master_key_hash = self.engine.hash_credential(new_master)?;
        record.recovery_key_hash = self.engine.hash_credential(&recovery)?;
        record.encrypted_recovery_key =
            self.engine
                .seal(recovery.as_bytes(), new_master, KeyPurpose::RecoveryKeyWrap)?;
        record.master_key_encrypted_with_recovery_key =
            self.engine
                .seal(new_master.as_bytes(), &recovery, KeyPurpose::MasterKeyWrap)?;
        self.store.replace_scrubbed(&record)?;
        info!(profile_id = %id, folders = record.folders.len(), "Profile credentials replaced");

        let rotation = self.complete_rotations(&mut record, new_master);
        self.store.save(&record)?;
        if !rotation.failed.is_empty() {
            warn!(
                profile_id = %id,
                failed = rotation.failed.len(),
                "Some folders still await re-encryption"
            );
        }
        Ok(PasswordChange {
            recovery_key,
            rotation,
        })
    }

    /// Retry rotation of folders left behind by a password change.
    pub fn retry_folder_reencryption(
        &self,
        id: &ProfileId,
        master: &Passphrase,
    ) -> Result<RotationReport> {
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        let mut record = self.authorize(id, master)?;
        let rotation = self.complete_rotations(&mut record, master);
        self.store.save(&record)?;
        Ok(rotation)
    }

    fn complete_rotations(&self, record: &mut ProfileRecord, master: &Passphrase) -> RotationReport {
        let vault_id = VaultId::for_profile(&record.id);
        let mut report = RotationReport::default();
        for entry in record.folders.iter_mut().filter(|e| e.legacy_key.is_some()) {
            match self.rotate_entry(&vault_id, entry, master) {
                Ok(()) => report.reencrypted.push(entry.folder_id.clone()),
                Err(e) => {
                    warn!(
                        profile_id = %record.id,
                        folder_id = %entry.folder_id,
                        error = %e,
                        "Folder rotation failed"
                    );
                    report.failed.push(FolderFailure {
                        folder_id: entry.folder_id.clone(),
                        error_kind: e.kind(),
                    });
                }
            }
        }
        report
    }

    fn rotate_entry(
        &self,
        vault_id: &VaultId,
        entry: &mut FolderEntry,
        master: &Passphrase,
    ) -> Result<()> {
        let Some(sealed) = &entry.legacy_key else {
            return Ok(());
        };
        let previous = self.unseal_text(sealed, master)?;
        self.vaults
            .reencrypt_folder(vault_id, &entry.folder_id, &previous, master)?;
        entry.legacy_key = None;
        Ok(())
    }

    fn unseal_text(&self, sealed: &SealedSecret, passphrase: &Passphrase) -> Result<Passphrase> {
        let bytes = self.engine.unseal(sealed, passphrase)?;
        let text = std::str::from_utf8(bytes.as_bytes())
            .map_err(|_| Error::Crypto("Sealed key is not valid text".to_string()))?;
        Ok(Passphrase::new(text))
    }

    // ========================================================================
    // Vault maintenance
    // ========================================================================

    /// Run `op` on the profile's vault under the profile lock.
    fn with_vault<T>(&self, id: &ProfileId, op: impl FnOnce(&VaultId) -> Result<T>) -> Result<T> {
        if !self.store.exists(id) {
            return Err(Error::NotFound(format!("Profile not found: {}", id)));
        }
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        op(&VaultId::for_profile(id))
    }

    /// # Errors
    /// - `NotFound` for an unknown profile
    pub fn validate_vault_integrity(&self, id: &ProfileId) -> Result<bool> {
        self.with_vault(id, |vault_id| self.vaults.validate_vault_integrity(vault_id))
    }

    /// Run vault recovery for a profile.
    ///
    /// # Errors
    /// - `NotFound` for an unknown profile
    pub fn attempt_vault_recovery(&self, id: &ProfileId) -> Result<RecoveryReport> {
        self.with_vault(id, |vault_id| self.vaults.attempt_vault_recovery(vault_id))
    }

    /// Remove leftovers of interrupted operations from the profile's vault.
    pub fn cleanup_temp_area(&self, id: &ProfileId) -> Result<usize> {
        self.with_vault(id, |vault_id| self.vaults.cleanup_temp_area(vault_id))
    }

    pub fn snapshot_vault(&self, id: &ProfileId) -> Result<PathBuf> {
        self.with_vault(id, |vault_id| self.vaults.snapshot_vault(vault_id))
    }

    // ========================================================================
    // Active profile
    // ========================================================================

    /// # Errors
    /// - `NotFound` for an unknown profile
    pub fn set_active_profile(&self, id: &ProfileId) -> Result<()> {
        if !self.store.exists(id) {
            return Err(Error::NotFound(format!("Profile not found: {}", id)));
        }
        *self.active.write() = Some(id.clone());
        debug!(profile_id = %id, "Active profile set");
        Ok(())
    }

    pub fn active_profile(&self) -> Option<ProfileId> {
        self.active.read().clone()
    }

    pub fn clear_active_profile(&self) {
        *self.active.write() = None;
    }

    // ========================================================================
    // Folders
    // ========================================================================

    /// Lock a folder into the profile's vault.
    ///
    /// Locking a folder that is temporarily unlocked relocks it over its
    /// retained vault copy.
    ///
    /// # Errors
    /// - `AlreadyExists` if the folder is already locked
    /// - Any error of [`VaultHandler::hide_folder`]
    pub fn lock_folder(
        &self,
        id: &ProfileId,
        master: &Passphrase,
        path: &Path,
    ) -> Result<HideResult> {
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        let mut record = self.authorize(id, master)?;
        let vault_id = VaultId::for_profile(id);
        self.vaults.create_vault_structure(&vault_id, id)?;

        let source = fs::canonicalize(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                Error::NotFound(format!("No such folder: {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        let folder_id = folder_id_for(&source)?;
        if let Some(entry) = record.folder(&folder_id) {
            if entry.state == FolderState::Locked {
                return Err(Error::AlreadyExists(format!(
                    "Folder already locked: {}",
                    folder_id
                )));
            }
            let result = self.relock_entry(&mut record, &folder_id, master)?;
            self.store.save(&record)?;
            return Ok(result);
        }

        let result = self.vaults.hide_folder(&source, &vault_id, master)?;
        record.folders.push(FolderEntry {
            folder_id: result.folder_id.clone(),
            original_path: source,
            state: FolderState::Locked,
            locked_at: self.now(),
            legacy_key: None,
        });
        if let Err(e) = self.store.save(&record) {
            warn!(profile_id = %id, error = %e, "Profile not saved; reverting lock");
            let reverted = self
                .vaults
                .restore_folder(&vault_id, &result.folder_id, master)
                .and_then(|_| self.vaults.secure_delete_from_vault(&vault_id, &result.folder_id));
            if let Err(undo) = reverted {
                warn!(folder_id = %result.folder_id, error = %undo, "Lock not reverted");
            }
            return Err(e);
        }

        info!(profile_id = %id, folder_id = %result.folder_id, "Folder locked");
        Ok(result)
    }

    fn relock_entry(
        &self,
        record: &mut ProfileRecord,
        folder_id: &FolderId,
        master: &Passphrase,
    ) -> Result<HideResult> {
        let vault_id = VaultId::for_profile(&record.id);
        let result = self.vaults.relock_folder(&vault_id, folder_id, master)?;
        let now = self.now();
        if let Some(entry) = record.folder_mut(folder_id) {
            entry.state = FolderState::Locked;
            entry.locked_at = now;
            // The vault copy was just rewritten under the current key.
            entry.legacy_key = None;
        }
        Ok(result)
    }

    /// Unlock one folder.
    ///
    /// # Errors
    /// - `NotFound` if the profile does not own the folder
    /// - Any error of [`VaultHandler::restore_folder`]; the vault copy is
    ///   untouched in that case
    pub fn unlock_folder(
        &self,
        id: &ProfileId,
        master: &Passphrase,
        folder_id: &FolderId,
        mode: UnlockMode,
    ) -> Result<UnlockResult> {
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        let mut record = self.authorize(id, master)?;
        let outcome = self.unlock_entry(&mut record, folder_id, master, mode);
        self.store.save(&record)?;
        outcome
    }

    /// Unlock every folder of a profile. Temporary mode skips folders that
    /// are already unlocked; per-folder failures are reported, not fatal.
    pub fn unlock_folders(
        &self,
        id: &ProfileId,
        master: &Passphrase,
        mode: UnlockMode,
    ) -> Result<UnlockSummary> {
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        let mut record = self.authorize(id, master)?;

        let targets: Vec<FolderId> = record
            .folders
            .iter()
            .filter(|f| mode == UnlockMode::Permanent || f.state == FolderState::Locked)
            .map(|f| f.folder_id.clone())
            .collect();

        let mut summary = UnlockSummary::default();
        for folder_id in targets {
            match self.unlock_entry(&mut record, &folder_id, master, mode) {
                Ok(result) => summary.unlocked.push(result),
                Err(e) => {
                    warn!(profile_id = %id, folder_id = %folder_id, error = %e, "Unlock failed");
                    summary.failed.push(FolderFailure {
                        folder_id,
                        error_kind: e.kind(),
                    });
                }
            }
        }
        self.store.save(&record)?;
        info!(
            profile_id = %id,
            mode = ?mode,
            unlocked = summary.unlocked.len(),
            failed = summary.failed.len(),
            "Folders unlocked"
        );
        Ok(summary)
    }

    /// Restore a folder and securely delete its vault copy.
    pub fn remove_folder(
        &self,
        id: &ProfileId,
        master: &Passphrase,
        folder_id: &FolderId,
    ) -> Result<UnlockResult> {
        self.unlock_folder(id, master, folder_id, UnlockMode::Permanent)
    }

    /// Relock every temporarily unlocked folder with its current contents.
    pub fn relock_folders(&self, id: &ProfileId, master: &Passphrase) -> Result<RelockSummary> {
        let lock = self.profile_lock(id);
        let _guard = lock.lock();
        let mut record = self.authorize(id, master)?;

        let targets: Vec<FolderId> = record
            .folders
            .iter()
            .filter(|f| f.state == FolderState::UnlockedTemporary)
            .map(|f| f.folder_id.clone())
            .collect();

        let mut summary = RelockSummary::default();
        for folder_id in targets {
            match self.relock_entry(&mut record, &folder_id, master) {
                Ok(_) => summary.relocked.push(folder_id),
                Err(e) => {
                    warn!(profile_id = %id, folder_id = %folder_id, error = %e, "Relock failed");
                    summary.failed.push(FolderFailure {
                        folder_id,
                        error_kind: e.kind(),
                    });
                }
            }
        }
        self.store.save(&record)?;
        Ok(summary)
    }

    /// Folders owned by a profile.
    ///
    /// # Errors
    /// - `NotFound` for an unknown profile
    pub fn list_folders(&self, id: &ProfileId) -> Result<Vec<FolderSummary>> {
        let record = self.store.load(id)?;
        Ok(record.folders.iter().map(FolderSummary::from).collect())
    }

    fn unlock_entry(
        &self,
        record: &mut ProfileRecord,
        folder_id: &FolderId,
        master: &Passphrase,
        mode: UnlockMode,
    ) -> Result<UnlockResult> {
        let vault_id = VaultId::for_profile(&record.id);
        let entry = record
            .folder(folder_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Folder not owned by profile: {}", folder_id)))?;

        let mut result = UnlockResult {
            folder_id: folder_id.clone(),
            restored_path: entry.original_path.clone(),
            mode,
            metadata_restored: true,
            metadata_error: None,
            bytes_freed: 0,
        };

        let needs_restore = match entry.state {
            FolderState::Locked => true,
            FolderState::UnlockedTemporary => !entry.original_path.is_dir(),
        };
        if needs_restore {
            let (restored, key) = self.restore_with_known_keys(&vault_id, &entry, master)?;
            result.restored_path = restored.restored_path;
            result.metadata_restored = restored.metadata_restored;
            result.metadata_error = restored.metadata_error;

            if let Some(live) = record.folder_mut(folder_id) {
                live.state = FolderState::UnlockedTemporary;
                if live.legacy_key.is_some() && mode == UnlockMode::Temporary {
                    if key == *master {
                        live.legacy_key = None;
                    } else if let Err(e) = self.rotate_entry(&vault_id, live, master) {
                        warn!(folder_id = %folder_id, error = %e, "Rotation after unlock failed");
                    }
                }
            }
        }

        if mode == UnlockMode::Permanent {
            let cleanup = self.vaults.secure_delete_from_vault(&vault_id, folder_id)?;
            result.bytes_freed = cleanup.bytes_freed;
            record.folders.retain(|f| &f.folder_id != folder_id);
        }

        info!(folder_id = %folder_id, mode = ?mode, "Folder unlocked");
        Ok(result)
    }

    /// Restore with the legacy key first, if any, then the current key.
    /// Returns the key that opened the folder.
    fn restore_with_known_keys(
        &self,
        vault_id: &VaultId,
        entry: &FolderEntry,
        master: &Passphrase,
    ) -> Result<(veilvault_vault::RestoreResult, Passphrase)> {
        let mut keys = Vec::with_capacity(2);
        if let Some(sealed) = &entry.legacy_key {
            keys.push(self.unseal_text(sealed, master)?);
        }
        keys.push(master.clone());

        let mut last = None;
        for key in keys {
            match self.vaults.restore_folder(vault_id, &entry.folder_id, &key) {
                Ok(result) => return Ok((result, key)),
                Err(Error::Crypto(detail)) => last = Some(Error::Crypto(detail)),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::Crypto("No key opened the folder".to_string())))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;
    use veilvault_common::ManualClock;
    use veilvault_crypto::{CryptoConfig, VerifierParams};
    use veilvault_security::SecurityConfig;
    use veilvault_vault::{NativePlatform, Platform, VaultConfig};

    pub struct Fixture {
        pub dir: TempDir,
        pub clock: Arc<ManualClock>,
        pub manager: ProfileManager,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with(ProfilePolicy::default(), Arc::new(NativePlatform))
        }

        pub fn with(policy: ProfilePolicy, platform: Arc<dyn Platform>) -> Self {
            let dir = TempDir::new().unwrap();
            let clock = Arc::new(ManualClock::default());
            let engine = Arc::new(
                EncryptionEngine::new(CryptoConfig {
                    chunk_size: 64,
                    verifier: VerifierParams::insecure_fast(),
                    ..CryptoConfig::default()
                })
                .unwrap(),
            );
            let security = Arc::new(
                SecurityMonitor::new(
                    SecurityConfig::default(),
                    &dir.path().join("data/logs/security_events.jsonl"),
                    clock.clone(),
                )
                .unwrap(),
            );
            let vaults = Arc::new(
                VaultHandler::with_platform(
                    dir.path().join("data/vaults"),
                    Arc::clone(&engine),
                    Arc::clone(&security),
                    VaultConfig::default(),
                    platform,
                )
                .unwrap(),
            );
            let manager = ProfileManager::new(
                dir.path().join("data/profiles"),
                engine,
                security,
                vaults,
                policy,
            )
            .unwrap();
            Self {
                dir,
                clock,
                manager,
            }
        }

        /// A two-file folder outside the data directory.
        pub fn folder(&self, name: &str) -> PathBuf {
            let folder = self.dir.path().join("home").join(name);
            fs::create_dir_all(folder.join("sub")).unwrap();
            fs::write(folder.join("a.txt"), b"alpha").unwrap();
            fs::write(folder.join("sub/b.txt"), b"bravo").unwrap();
            fs::canonicalize(folder).unwrap()
        }
    }
}
