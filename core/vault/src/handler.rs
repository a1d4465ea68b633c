//! The folder vault handler.
//!
//! Moves folders into and out of a profile's vault. Content is encrypted
//! into a staging directory under `temp/`, renamed into `hidden/` only when
//! complete, and every destructive step runs under a [`ScopedBackup`] so a
//! failure at any point leaves the original and the vault as they were.
//!
//! The handler never stores key material. Callers pass the master key for
//! each operation and folder keys are re-derived from the stored salt.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::{HideStrategy, VaultConfig};
use crate::metadata::{
    apply_attributes, folder_id_for, join_relative, preserve_folder_metadata, CipherRecord,
    EntryKind, EntryMetadata, FolderMetadata, HideMethod, PreservedMetadata,
};
use crate::platform::{self, NativePlatform, Platform};
use crate::shred;
use crate::structure::{read_json, write_json_atomic, VaultLayout, VaultStructure, VaultVersion};
use veilvault_common::{Clock, Error, FolderId, Passphrase, ProfileId, Result, VaultId};
use veilvault_crypto::{sha256_file, EncryptionEngine, EncryptionKey, KeyPurpose, Salt};
use veilvault_security::backup::{cleanup_backups, copy_tree, create_private_dir, remove_path};
use veilvault_security::recovery::{HIDDEN_DIR, METADATA_DIR};
use veilvault_security::{FileVerifier, RecoveryReport, ScopedBackup, SecurityMonitor};

const FILE_SALT_LENGTH: usize = 32;

/// Outcome of hiding a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HideResult {
    pub folder_id: FolderId,
    /// Where the encrypted copy lives.
    pub backup_location: PathBuf,
    pub hide_method: HideMethod,
    /// A placeholder was left because removal was not permitted.
    pub fallback_used: bool,
    pub message: String,
}

/// Outcome of restoring a folder.
///
/// Content restoration failures are errors; a metadata failure after the
/// content is in place is reported here instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub folder_id: FolderId,
    pub restored_path: PathBuf,
    pub metadata_restored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<String>,
}

/// Outcome of secure deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub folders_cleaned: usize,
    pub bytes_freed: u64,
}

/// A vault whose manifest has been loaded.
struct OpenVault {
    layout: VaultLayout,
    structure: VaultStructure,
}

/// Moves folders between their original location and a vault.
pub struct VaultHandler {
    vaults_root: PathBuf,
    engine: Arc<EncryptionEngine>,
    security: Arc<SecurityMonitor>,
    platform: Arc<dyn Platform>,
    config: VaultConfig,
}

impl VaultHandler {
    /// Create a handler storing vaults under `vaults_root`.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid configuration
    /// - I/O errors creating the vaults root
    pub fn new(
        vaults_root: impl Into<PathBuf>,
        engine: Arc<EncryptionEngine>,
        security: Arc<SecurityMonitor>,
        config: VaultConfig,
    ) -> Result<Self> {
        Self::with_platform(vaults_root, engine, security, config, Arc::new(NativePlatform))
    }

    /// Create a handler with an explicit platform.
    pub fn with_platform(
        vaults_root: impl Into<PathBuf>,
        engine: Arc<EncryptionEngine>,
        security: Arc<SecurityMonitor>,
        config: VaultConfig,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        config.validate()?;
        let vaults_root = vaults_root.into();
        create_private_dir(&vaults_root)?;
        Ok(Self {
            vaults_root,
            engine,
            security,
            platform,
            config,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn layout(&self, vault_id: &VaultId) -> VaultLayout {
        VaultLayout::new(&self.vaults_root, vault_id)
    }

    /// Vault directory for `vault_id`.
    pub fn vault_path(&self, vault_id: &VaultId) -> PathBuf {
        self.layout(vault_id).root().to_path_buf()
    }

    fn open(&self, vault_id: &VaultId) -> Result<OpenVault> {
        let layout = self.layout(vault_id);
        let manifest = layout.manifest();
        if !manifest.exists() {
            return Err(Error::NotFound(format!("Vault not found: {}", vault_id)));
        }
        let structure: VaultStructure = read_json(&manifest)?;
        if !structure.version.is_compatible() {
            return Err(Error::Vault(format!(
                "Unsupported vault version {}.{}",
                structure.version.major, structure.version.minor
            )));
        }
        Ok(OpenVault { layout, structure })
    }

    /// Create the directory tree and manifest for a profile's vault.
    ///
    /// Idempotent: an existing vault owned by the same profile is repaired
    /// (missing directories recreated, orphaned staging removed) and its
    /// manifest returned.
    ///
    /// # Errors
    /// - `NotPermitted` if the vault belongs to a different profile
    pub fn create_vault_structure(
        &self,
        vault_id: &VaultId,
        profile_id: &ProfileId,
    ) -> Result<VaultStructure> {
        let layout = self.layout(vault_id);
        if layout.manifest().exists() {
            let vault = self.open(vault_id)?;
            if vault.structure.profile_id != *profile_id {
                return Err(Error::NotPermitted(
                    "Vault belongs to another profile".to_string(),
                ));
            }
            for dir in layout.directories() {
                create_private_dir(&dir)?;
            }
            self.cleanup_temp_area(vault_id)?;
            return Ok(vault.structure);
        }

        create_private_dir(layout.root())?;
        for dir in layout.directories() {
            create_private_dir(&dir)?;
        }
        let now = self.security.clock().now();
        let structure = VaultStructure {
            vault_id: vault_id.clone(),
            profile_id: profile_id.clone(),
            version: VaultVersion::CURRENT,
            created_at: now,
            last_modified: now,
        };
        write_json_atomic(&layout.manifest(), &structure)?;
        info!(vault_id = %vault_id, "Vault structure created");
        Ok(structure)
    }

    /// Load a vault's manifest.
    pub fn get_vault_structure(&self, vault_id: &VaultId) -> Result<VaultStructure> {
        Ok(self.open(vault_id)?.structure)
    }

    /// Remove orphaned staging left by an interrupted operation, and
    /// scoped backups past their retention.
    pub fn cleanup_temp_area(&self, vault_id: &VaultId) -> Result<usize> {
        let layout = self.layout(vault_id);
        let mut removed = 0;
        if layout.temp().is_dir() {
            for entry in fs::read_dir(layout.temp())? {
                remove_path(&entry?.path())?;
                removed += 1;
            }
        }
        let retention = std::time::Duration::from_secs(self.config.backup_retention_secs);
        cleanup_backups(&layout.backup(), retention)?;
        if removed > 0 {
            warn!(vault_id = %vault_id, removed, "Orphaned staging removed");
        }
        Ok(removed)
    }

    /// Capture metadata of a folder without modifying it.
    pub fn preserve_folder_metadata(&self, path: &Path) -> Result<PreservedMetadata> {
        preserve_folder_metadata(path)
    }

    /// Identifiers of every folder stored in the vault.
    pub fn list_vault_folders(&self, vault_id: &VaultId) -> Result<Vec<FolderId>> {
        let vault = self.open(vault_id)?;
        let mut folders = Vec::new();
        for entry in fs::read_dir(vault.layout.metadata_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(id) = FolderId::new(stem) {
                folders.push(id);
            }
        }
        folders.sort();
        Ok(folders)
    }

    /// Load the stored metadata of one folder.
    pub fn load_folder_metadata(
        &self,
        vault_id: &VaultId,
        folder_id: &FolderId,
    ) -> Result<FolderMetadata> {
        let layout = self.layout(vault_id);
        load_metadata(&layout, folder_id)
    }

    /// Whether removing `path` needs privileges the process lacks.
    pub fn requires_elevated_privileges(&self, path: &Path) -> bool {
        platform::requires_elevated_privileges(self.platform.as_ref(), path)
    }

    /// Encrypt a folder into the vault and take it out of view.
    ///
    /// # Preconditions
    /// - `path` is a directory outside the vaults root
    /// - The vault exists
    ///
    /// # Postconditions
    /// - Ciphertext and metadata are in the vault
    /// - The original is removed or, when removal is not permitted, left
    ///   as an empty placeholder (`fallback_used`)
    /// - On any error the original and the vault are unchanged
    ///
    /// # Errors
    /// - `NotFound` for a missing vault or path
    /// - `AlreadyExists` if the folder is already vaulted
    /// - `Privilege` if neither removal nor the placeholder is possible
    pub fn hide_folder(
        &self,
        path: &Path,
        vault_id: &VaultId,
        master: &Passphrase,
    ) -> Result<HideResult> {
        let vault = self.open(vault_id)?;
        let source = self.resolve_source(path)?;
        let folder_id = folder_id_for(&source)?;
        if vault.layout.metadata_file(&folder_id).exists()
            || vault.layout.hidden_folder(&folder_id).exists()
        {
            return Err(Error::AlreadyExists(format!(
                "Folder already vaulted: {}",
                folder_id
            )));
        }

        let result = self.seal_folder(&vault, &source, &folder_id, master)?;
        info!(
            vault_id = %vault_id,
            folder_id = %folder_id,
            method = ?result.hide_method,
            "Folder hidden"
        );
        Ok(result)
    }

    /// Re-encrypt the current contents of a temporarily unlocked folder
    /// over its retained vault copy and hide it again.
    pub fn relock_folder(
        &self,
        vault_id: &VaultId,
        folder_id: &FolderId,
        master: &Passphrase,
    ) -> Result<HideResult> {
        let vault = self.open(vault_id)?;
        let metadata = load_metadata(&vault.layout, folder_id)?;
        let source = metadata.original_path().to_path_buf();
        if !source.is_dir() || platform::is_placeholder(&source) {
            return Err(Error::NotFound(format!(
                "Folder is not unlocked: {}",
                folder_id
            )));
        }

        let result = self.seal_folder(&vault, &source, folder_id, master)?;
        info!(vault_id = %vault_id, folder_id = %folder_id, "Folder relocked");
        Ok(result)
    }

    fn resolve_source(&self, path: &Path) -> Result<PathBuf> {
        let source = fs::canonicalize(path).map_err(|e| io_not_found(e, path))?;
        let root = fs::canonicalize(&self.vaults_root)?;
        if source.starts_with(&root) || root.starts_with(&source) {
            return Err(Error::InvalidInput(
                "Folder overlaps the vault storage area".to_string(),
            ));
        }
        if !source.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Not a directory: {}",
                source.display()
            )));
        }
        Ok(source)
    }

    /// Encrypt `source` and swap it into `hidden/<folder_id>`, replacing
    /// any previous copy.
    fn seal_folder(
        &self,
        vault: &OpenVault,
        source: &Path,
        folder_id: &FolderId,
        master: &Passphrase,
    ) -> Result<HideResult> {
        let layout = &vault.layout;
        let profile_id = &vault.structure.profile_id;

        let mut preserved = preserve_folder_metadata(source)?;
        let method = self.choose_hide_method(source)?;

        let folder_salt = Salt::generate(KeyPurpose::FolderContent);
        let folder_key = self.engine.derive_key(master, &folder_salt)?;
        let staging = staging_dir(layout, "seal-")?;
        self.encrypt_entries(profile_id, source, staging.path(), &folder_key, &mut preserved.entries)?;

        let metadata = FolderMetadata {
            folder_id: folder_id.clone(),
            vault_id: vault.structure.vault_id.clone(),
            hidden_at: self.security.clock().now(),
            hide_method: method,
            folder_salt,
            content_checksum: FolderMetadata::compute_checksum(&preserved),
            preserved,
        };

        let hidden_dir = layout.hidden_folder(folder_id);
        let metadata_file = layout.metadata_file(folder_id);
        let original_guard = ScopedBackup::new(source, layout.backup())?;
        let hidden_guard = ScopedBackup::new(&hidden_dir, layout.backup())?;
        let metadata_guard = ScopedBackup::new(&metadata_file, layout.backup())?;

        remove_path(&hidden_dir)?;
        fs::rename(staging.path(), &hidden_dir)?;
        write_json_atomic(&metadata_file, &metadata)?;

        match method {
            HideMethod::Removed => remove_path(source)?,
            HideMethod::Placeholder => platform::make_placeholder(source).map_err(|e| match e {
                Error::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => Error::Privilege(
                    "Original location can be neither removed nor emptied".to_string(),
                ),
                other => other,
            })?,
        }

        original_guard.commit()?;
        hidden_guard.commit()?;
        metadata_guard.commit()?;
        self.after_change(&vault.structure.vault_id);

        let fallback_used =
            method == HideMethod::Placeholder && self.config.hide_strategy == HideStrategy::Auto;
        Ok(HideResult {
            folder_id: folder_id.clone(),
            backup_location: hidden_dir,
            hide_method: method,
            fallback_used,
            message: if fallback_used {
                "Folder secured; a placeholder was left because removal requires elevated privileges"
                    .to_string()
            } else {
                "Folder secured".to_string()
            },
        })
    }

    fn choose_hide_method(&self, source: &Path) -> Result<HideMethod> {
        let removable = self.platform.is_elevated() || self.platform.can_remove(source);
        match self.config.hide_strategy {
            HideStrategy::Placeholder => Ok(HideMethod::Placeholder),
            HideStrategy::Remove if removable => Ok(HideMethod::Removed),
            HideStrategy::Remove => Err(Error::Privilege(
                "Removing the original requires elevated privileges".to_string(),
            )),
            HideStrategy::Auto if removable => Ok(HideMethod::Removed),
            HideStrategy::Auto => {
                warn!("Original cannot be removed; falling back to placeholder");
                Ok(HideMethod::Placeholder)
            }
        }
    }

    fn encrypt_entries(
        &self,
        profile_id: &ProfileId,
        source: &Path,
        staging: &Path,
        folder_key: &EncryptionKey,
        entries: &mut [EntryMetadata],
    ) -> Result<()> {
        let files = entries.iter_mut().filter(|e| e.kind == EntryKind::File);
        for (index, entry) in files.enumerate() {
            let stored_name = format!("{}.enc", index);
            let mut salt = vec![0u8; FILE_SALT_LENGTH];
            rand::thread_rng().fill_bytes(&mut salt);
            let file_key = folder_key.derive_file_key(&salt);

            let src = join_relative(source, &entry.relative_path)?;
            let info = self
                .engine
                .encrypt_file(&src, &staging.join(&stored_name), &file_key)
                .map_err(|e| {
                    self.security
                        .handle_encryption_error(Some(profile_id), "encrypt_file", &e.to_string());
                    e
                })?;

            entry.cipher = Some(CipherRecord {
                stored_name,
                salt,
                iv: info.iv,
                plaintext_len: info.plaintext_len,
                plaintext_sha256: info.plaintext_sha256,
                ciphertext_sha256: info.ciphertext_sha256,
            });
        }
        Ok(())
    }

    /// Decrypt a folder back to its original path and reapply its
    /// metadata. The vault copy is kept.
    ///
    /// A placeholder at the original path is replaced; any other existing
    /// content there is never overwritten.
    ///
    /// # Errors
    /// - `NotFound` for an unknown vault or folder
    /// - `AlreadyExists` if the original path is occupied
    /// - `Crypto` if decryption fails
    /// - `Integrity` / `DataLoss` if stored content is corrupted and could
    ///   not be recovered
    pub fn restore_folder(
        &self,
        vault_id: &VaultId,
        folder_id: &FolderId,
        master: &Passphrase,
    ) -> Result<RestoreResult> {
        let vault = self.open(vault_id)?;
        let metadata = self.ensure_intact(&vault, folder_id)?;
        let folder_key = self.engine.derive_key(master, &metadata.folder_salt)?;

        let target = metadata.original_path().to_path_buf();
        let placeholder = platform::is_placeholder(&target);
        if !placeholder && fs::symlink_metadata(&target).is_ok() {
            return Err(Error::AlreadyExists(format!(
                "Original location is occupied: {}",
                target.display()
            )));
        }
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput("Original path has no parent".to_string()))?;
        fs::create_dir_all(parent)?;

        let staging = tempfile::Builder::new()
            .prefix(".veilvault-restore-")
            .tempdir_in(parent)?;
        self.decrypt_entries(
            &vault,
            &vault.layout.hidden_folder(folder_id),
            staging.path(),
            &folder_key,
            &metadata.preserved,
        )?;

        if placeholder {
            platform::clear_placeholder(&target)?;
            fs::remove_dir(&target)?;
        }
        fs::rename(staging.path(), &target)?;

        let failed = apply_folder_attributes(&target, &metadata.preserved);
        let metadata_error = if failed == 0 {
            None
        } else {
            warn!(folder_id = %folder_id, failed, "Metadata partially restored");
            Some(format!("{} item(s) could not have their metadata restored", failed))
        };

        info!(vault_id = %vault_id, folder_id = %folder_id, "Folder restored");
        Ok(RestoreResult {
            folder_id: folder_id.clone(),
            restored_path: target,
            metadata_restored: metadata_error.is_none(),
            metadata_error,
        })
    }

    fn decrypt_entries(
        &self,
        vault: &OpenVault,
        hidden_dir: &Path,
        out: &Path,
        folder_key: &EncryptionKey,
        preserved: &PreservedMetadata,
    ) -> Result<()> {
        for entry in &preserved.entries {
            let dest = join_relative(out, &entry.relative_path)?;
            match entry.kind {
                EntryKind::Directory => fs::create_dir_all(&dest)?,
                EntryKind::Symlink => create_symlink(entry, &dest)?,
                EntryKind::File => {
                    let cipher = entry.cipher.as_ref().ok_or_else(|| {
                        Error::Integrity(format!("No cipher record for {}", entry.relative_path))
                    })?;
                    let file_key = folder_key.derive_file_key(&cipher.salt);
                    let digest = self
                        .engine
                        .decrypt_file(&cipher.iv, &hidden_dir.join(&cipher.stored_name), &dest, &file_key)
                        .map_err(|e| {
                            self.security.handle_encryption_error(
                                Some(&vault.structure.profile_id),
                                "decrypt_file",
                                &e.to_string(),
                            );
                            e
                        })?;
                    if !veilvault_crypto::checksums_match(&digest, &cipher.plaintext_sha256) {
                        return Err(Error::Integrity(format!(
                            "Plaintext checksum mismatch for {}",
                            cipher.stored_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Files of a folder whose ciphertext no longer matches its metadata.
    fn corrupted_files(layout: &VaultLayout, metadata: &FolderMetadata) -> Vec<String> {
        let hidden_dir = layout.hidden_folder(&metadata.folder_id);
        let mut corrupted = Vec::new();
        if FolderMetadata::compute_checksum(&metadata.preserved) != metadata.content_checksum {
            corrupted.push(format!("{}.json", metadata.folder_id));
        }
        for cipher in metadata.preserved.entries.iter().filter_map(|e| e.cipher.as_ref()) {
            let intact = sha256_file(&hidden_dir.join(&cipher.stored_name))
                .map(|digest| veilvault_crypto::checksums_match(&digest, &cipher.ciphertext_sha256))
                .unwrap_or(false);
            if !intact {
                corrupted.push(cipher.stored_name.clone());
            }
        }
        corrupted
    }

    /// Load a folder's metadata, running vault recovery first if its
    /// stored content fails verification.
    fn ensure_intact(&self, vault: &OpenVault, folder_id: &FolderId) -> Result<FolderMetadata> {
        let metadata = load_metadata(&vault.layout, folder_id)?;
        let corrupted = Self::corrupted_files(&vault.layout, &metadata);
        if corrupted.is_empty() {
            return Ok(metadata);
        }

        let report = self.recover(vault, &format!(
            "{} stored file(s) failed checksum verification",
            corrupted.len()
        ))?;
        debug!(recovered = report.recovered_files.len(), "Recovery finished");

        let metadata = load_metadata(&vault.layout, folder_id)?;
        if Self::corrupted_files(&vault.layout, &metadata).is_empty() {
            Ok(metadata)
        } else {
            Err(Error::DataLoss(format!(
                "Folder {} could not be fully recovered",
                folder_id
            )))
        }
    }

    /// Run vault recovery with a verifier backed by the stored checksums.
    fn recover(&self, vault: &OpenVault, detail: &str) -> Result<RecoveryReport> {
        let verifier = StoredChecksums {
            root: vault.layout.root().to_path_buf(),
            expected: self.expected_checksums(vault)?,
        };
        self.security.handle_vault_corruption(
            Some(&vault.structure.profile_id),
            vault.layout.root(),
            detail,
            &verifier,
        )
    }

    /// `hidden/<folder>/<file>` to expected ciphertext digest, for every
    /// folder whose metadata can be read.
    fn expected_checksums(&self, vault: &OpenVault) -> Result<HashMap<String, String>> {
        let mut expected = HashMap::new();
        for folder_id in self.list_vault_folders(&vault.structure.vault_id)? {
            let Ok(metadata) = load_metadata(&vault.layout, &folder_id) else {
                continue;
            };
            for cipher in metadata.preserved.entries.iter().filter_map(|e| e.cipher.as_ref()) {
                expected.insert(
                    format!("{}/{}/{}", HIDDEN_DIR, folder_id, cipher.stored_name),
                    cipher.ciphertext_sha256.clone(),
                );
            }
        }
        Ok(expected)
    }

    /// Recompute stored checksums for every folder in the vault.
    pub fn validate_vault_integrity(&self, vault_id: &VaultId) -> Result<bool> {
        let vault = self.open(vault_id)?;
        let mut valid = true;
        for folder_id in self.list_vault_folders(vault_id)? {
            let metadata = match load_metadata(&vault.layout, &folder_id) {
                Ok(m) => m,
                Err(e) => {
                    warn!(folder_id = %folder_id, error = %e, "Unreadable folder metadata");
                    valid = false;
                    continue;
                }
            };
            let corrupted = Self::corrupted_files(&vault.layout, &metadata);
            if !corrupted.is_empty() {
                warn!(folder_id = %folder_id, files = corrupted.len(), "Integrity check failed");
                valid = false;
            }
        }
        Ok(valid)
    }

    /// Run recovery on a vault regardless of its current state.
    pub fn attempt_vault_recovery(&self, vault_id: &VaultId) -> Result<RecoveryReport> {
        let vault = self.open(vault_id)?;
        self.recover(&vault, "Recovery requested")
    }

    /// Overwrite and remove a folder's vault copy, metadata and snapshot
    /// copy. The only operation that destroys vault content.
    pub fn secure_delete_from_vault(
        &self,
        vault_id: &VaultId,
        folder_id: &FolderId,
    ) -> Result<CleanupResult> {
        let vault = self.open(vault_id)?;
        let layout = &vault.layout;
        let hidden_dir = layout.hidden_folder(folder_id);
        let metadata_file = layout.metadata_file(folder_id);
        if !hidden_dir.exists() && !metadata_file.exists() {
            return Err(Error::NotFound(format!("Folder not in vault: {}", folder_id)));
        }

        let passes = self.config.overwrite_passes;
        let snapshot = layout.snapshot();
        let mut bytes_freed = shred::shred_tree(&hidden_dir, passes)?;
        bytes_freed += shred::shred_tree(&metadata_file, passes)?;
        bytes_freed += shred::shred_tree(&snapshot.join(HIDDEN_DIR).join(folder_id.as_str()), passes)?;
        bytes_freed += shred::shred_tree(
            &snapshot
                .join(METADATA_DIR)
                .join(format!("{}.json", folder_id.as_str())),
            passes,
        )?;

        info!(vault_id = %vault_id, folder_id = %folder_id, bytes_freed, "Folder securely deleted");
        Ok(CleanupResult {
            folders_cleaned: 1,
            bytes_freed,
        })
    }

    /// Rotate a folder's vault copy from one master key to another.
    ///
    /// Content is decrypted into the temp area one file at a time,
    /// re-encrypted under a fresh folder salt, and the plaintext staging
    /// file overwritten before the next file. The vault copy is swapped
    /// only once every file succeeded.
    pub fn reencrypt_folder(
        &self,
        vault_id: &VaultId,
        folder_id: &FolderId,
        old_master: &Passphrase,
        new_master: &Passphrase,
    ) -> Result<()> {
        let vault = self.open(vault_id)?;
        let layout = &vault.layout;
        let mut metadata = self.ensure_intact(&vault, folder_id)?;
        let old_key = self.engine.derive_key(old_master, &metadata.folder_salt)?;
        let new_salt = Salt::generate(KeyPurpose::FolderContent);
        let new_key = self.engine.derive_key(new_master, &new_salt)?;

        let hidden_dir = layout.hidden_folder(folder_id);
        let plain = staging_dir(layout, "rotate-plain-")?;
        let cipher_out = staging_dir(layout, "rotate-")?;
        let rotated = self.rotate_entries(
            &mut metadata.preserved,
            &hidden_dir,
            plain.path(),
            cipher_out.path(),
            &old_key,
            &new_key,
        );
        if let Err(e) = rotated {
            shred::shred_tree(plain.path(), self.config.overwrite_passes)?;
            return Err(e);
        }
        metadata.folder_salt = new_salt;
        metadata.content_checksum = FolderMetadata::compute_checksum(&metadata.preserved);

        let metadata_file = layout.metadata_file(folder_id);
        let hidden_guard = ScopedBackup::new(&hidden_dir, layout.backup())?;
        let metadata_guard = ScopedBackup::new(&metadata_file, layout.backup())?;
        remove_path(&hidden_dir)?;
        fs::rename(cipher_out.path(), &hidden_dir)?;
        write_json_atomic(&metadata_file, &metadata)?;
        hidden_guard.commit()?;
        metadata_guard.commit()?;
        self.after_change(vault_id);

        info!(vault_id = %vault_id, folder_id = %folder_id, "Folder re-encrypted");
        Ok(())
    }

    fn rotate_entries(
        &self,
        preserved: &mut PreservedMetadata,
        hidden_dir: &Path,
        plain_dir: &Path,
        out_dir: &Path,
        old_key: &EncryptionKey,
        new_key: &EncryptionKey,
    ) -> Result<()> {
        for cipher in preserved.entries.iter_mut().filter_map(|e| e.cipher.as_mut()) {
            let plain_path = plain_dir.join(&cipher.stored_name);
            let digest = self.engine.decrypt_file(
                &cipher.iv,
                &hidden_dir.join(&cipher.stored_name),
                &plain_path,
                &old_key.derive_file_key(&cipher.salt),
            )?;
            if !veilvault_crypto::checksums_match(&digest, &cipher.plaintext_sha256) {
                return Err(Error::Integrity(format!(
                    "Plaintext checksum mismatch for {}",
                    cipher.stored_name
                )));
            }

            let mut salt = vec![0u8; FILE_SALT_LENGTH];
            rand::thread_rng().fill_bytes(&mut salt);
            let info = self.engine.encrypt_file(
                &plain_path,
                &out_dir.join(&cipher.stored_name),
                &new_key.derive_file_key(&salt),
            )?;
            shred::shred_tree(&plain_path, self.config.overwrite_passes)?;

            cipher.salt = salt;
            cipher.iv = info.iv;
            cipher.ciphertext_sha256 = info.ciphertext_sha256;
        }
        Ok(())
    }

    /// Replace the vault-level snapshot with a copy of the current hidden
    /// and metadata stores. Refuses to snapshot a vault that fails
    /// integrity validation.
    pub fn snapshot_vault(&self, vault_id: &VaultId) -> Result<PathBuf> {
        if !self.validate_vault_integrity(vault_id)? {
            return Err(Error::Integrity(
                "Refusing to snapshot a vault that fails validation".to_string(),
            ));
        }
        let layout = self.layout(vault_id);
        let snapshot = layout.snapshot();
        let incoming = layout.backup().join(".vault_snapshot.incoming");

        remove_path(&incoming)?;
        create_private_dir(&incoming)?;
        copy_tree(&layout.hidden(), &incoming.join(HIDDEN_DIR))?;
        copy_tree(&layout.metadata_dir(), &incoming.join(METADATA_DIR))?;
        remove_path(&snapshot)?;
        fs::rename(&incoming, &snapshot)?;

        debug!(vault_id = %vault_id, "Vault snapshot refreshed");
        Ok(snapshot)
    }

    /// Shred an entire vault, including backups and the manifest.
    ///
    /// # Errors
    /// - `NotFound` for an unknown vault
    pub fn delete_vault(&self, vault_id: &VaultId) -> Result<CleanupResult> {
        let vault = self.open(vault_id)?;
        let folders_cleaned = self.list_vault_folders(vault_id)?.len();
        let bytes_freed = shred::shred_tree(vault.layout.root(), self.config.overwrite_passes)?;
        info!(vault_id = %vault_id, folders_cleaned, bytes_freed, "Vault deleted");
        Ok(CleanupResult {
            folders_cleaned,
            bytes_freed,
        })
    }

    fn after_change(&self, vault_id: &VaultId) {
        if let Err(e) = self.touch_manifest(vault_id) {
            warn!(vault_id = %vault_id, error = %e, "Manifest not updated");
        }
        if self.config.snapshot_on_change {
            if let Err(e) = self.snapshot_vault(vault_id) {
                warn!(vault_id = %vault_id, error = %e, "Snapshot not refreshed");
            }
        }
    }

    fn touch_manifest(&self, vault_id: &VaultId) -> Result<()> {
        let mut vault = self.open(vault_id)?;
        vault.structure.last_modified = self.security.clock().now();
        write_json_atomic(&vault.layout.manifest(), &vault.structure)
    }
}

/// Judges vault files against the digests recorded in folder metadata.
struct StoredChecksums {
    root: PathBuf,
    /// `hidden/<folder>/<file>` to expected ciphertext digest.
    expected: HashMap<String, String>,
}

impl StoredChecksums {
    fn digest_matches(path: &Path, expected: &str) -> bool {
        sha256_file(path)
            .map(|actual| veilvault_crypto::checksums_match(&actual, expected))
            .unwrap_or(false)
    }
}

impl FileVerifier for StoredChecksums {
    fn verify(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if relative.starts_with(METADATA_DIR) {
            return consistent_record(path).is_some();
        }
        match self.expected.get(&relative) {
            Some(digest) => Self::digest_matches(path, digest),
            None => true,
        }
    }

    /// The snapshot copy is usable only if it is the version of the folder
    /// the live store describes: same content checksum and folder salt, or
    /// when the live record is unreadable, the same ciphertext on disk.
    fn snapshot_matches(&self, folder: &str, snapshot: &Path) -> bool {
        let record = format!("{}.json", folder);
        let Some(saved) = consistent_record(&snapshot.join(METADATA_DIR).join(&record)) else {
            return false;
        };
        if let Some(live) = consistent_record(&self.root.join(METADATA_DIR).join(&record)) {
            return live.content_checksum == saved.content_checksum
                && live.folder_salt == saved.folder_salt;
        }
        let hidden = self.root.join(HIDDEN_DIR).join(folder);
        saved
            .preserved
            .entries
            .iter()
            .filter_map(|e| e.cipher.as_ref())
            .all(|c| Self::digest_matches(&hidden.join(&c.stored_name), &c.ciphertext_sha256))
    }
}

/// A folder record that parses and whose content checksum agrees with its
/// per-file records.
fn consistent_record(path: &Path) -> Option<FolderMetadata> {
    let metadata: FolderMetadata = read_json(path).ok()?;
    (metadata.content_checksum == FolderMetadata::compute_checksum(&metadata.preserved))
        .then_some(metadata)
}

fn load_metadata(layout: &VaultLayout, folder_id: &FolderId) -> Result<FolderMetadata> {
    let path = layout.metadata_file(folder_id);
    if !path.exists() {
        return Err(Error::NotFound(format!("Folder not in vault: {}", folder_id)));
    }
    read_json(&path)
}

fn staging_dir(layout: &VaultLayout, prefix: &str) -> Result<TempDir> {
    create_private_dir(&layout.temp())?;
    Ok(tempfile::Builder::new().prefix(prefix).tempdir_in(layout.temp())?)
}

fn io_not_found(e: io::Error, path: &Path) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(format!("No such folder: {}", path.display()))
    } else {
        Error::Io(e)
    }
}

#[cfg(unix)]
fn create_symlink(entry: &EntryMetadata, dest: &Path) -> Result<()> {
    let target = entry
        .link_target
        .as_ref()
        .ok_or_else(|| Error::Integrity(format!("No link target for {}", entry.relative_path)))?;
    std::os::unix::fs::symlink(target, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(entry: &EntryMetadata, _dest: &Path) -> Result<()> {
    warn!(path = %entry.relative_path, "Symlink not restored on this platform");
    Ok(())
}

/// Apply captured attributes deepest-first, then the root. Returns the
/// number of paths that failed.
fn apply_folder_attributes(target: &Path, preserved: &PreservedMetadata) -> usize {
    let mut failed = 0;
    for entry in preserved.entries.iter().rev() {
        let applied = join_relative(target, &entry.relative_path)
            .and_then(|path| apply_attributes(&path, &entry.attributes));
        if let Err(e) = applied {
            debug!(error = %e, "Attribute restore failed");
            failed += 1;
        }
    }
    if let Err(e) = apply_attributes(target, &preserved.root) {
        debug!(error = %e, "Attribute restore failed");
        failed += 1;
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::Restricted;
    use tempfile::TempDir;
    use veilvault_common::SystemClock;
    use veilvault_crypto::{CryptoConfig, VerifierParams};
    use veilvault_security::{EventFilter, SecurityConfig, SecurityEventType};

    struct Fixture {
        dir: TempDir,
        handler: VaultHandler,
        vault_id: VaultId,
        master: Passphrase,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with(VaultConfig::default(), Arc::new(NativePlatform))
        }

        fn with(config: VaultConfig, platform: Arc<dyn Platform>) -> Self {
            let dir = TempDir::new().unwrap();
            let engine = EncryptionEngine::new(CryptoConfig {
                chunk_size: 64,
                verifier: VerifierParams::insecure_fast(),
                ..CryptoConfig::default()
            })
            .unwrap();
            let security = SecurityMonitor::new(
                SecurityConfig::default(),
                &dir.path().join("data/logs/security_events.jsonl"),
                Arc::new(SystemClock),
            )
            .unwrap();
            let handler = VaultHandler::with_platform(
                dir.path().join("data/vaults"),
                Arc::new(engine),
                Arc::new(security),
                config,
                platform,
            )
            .unwrap();
            let profile = ProfileId::new("alice").unwrap();
            let vault_id = VaultId::for_profile(&profile);
            handler.create_vault_structure(&vault_id, &profile).unwrap();
            Self {
                dir,
                handler,
                vault_id,
                master: Passphrase::new("M1"),
            }
        }

        fn folder(&self) -> PathBuf {
            self.folder_named("docs")
        }

        fn folder_named(&self, name: &str) -> PathBuf {
            let folder = self.dir.path().join("home").join(name);
            fs::create_dir_all(folder.join("nested")).unwrap();
            fs::write(folder.join("report.txt"), b"quarterly numbers").unwrap();
            fs::write(folder.join("nested/big.bin"), vec![7u8; 1000]).unwrap();
            fs::write(folder.join("empty"), b"").unwrap();
            fs::canonicalize(folder).unwrap()
        }

        fn hide(&self, folder: &Path) -> HideResult {
            self.handler
                .hide_folder(folder, &self.vault_id, &self.master)
                .unwrap()
        }
    }

    fn stored_file(fx: &Fixture, folder_id: &FolderId) -> PathBuf {
        fx.handler
            .layout(&fx.vault_id)
            .hidden_folder(folder_id)
            .join("0.enc")
    }

    #[test]
    fn test_hide_and_restore_round_trip() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let before = preserve_folder_metadata(&folder).unwrap();

        let hidden = fx.hide(&folder);
        assert_eq!(hidden.hide_method, HideMethod::Removed);
        assert!(!hidden.fallback_used);
        assert!(!folder.exists());
        assert!(hidden.backup_location.is_dir());
        assert_eq!(
            fx.handler.list_vault_folders(&fx.vault_id).unwrap(),
            vec![hidden.folder_id.clone()]
        );
        assert!(fx.handler.validate_vault_integrity(&fx.vault_id).unwrap());

        let restored = fx
            .handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();
        assert!(restored.metadata_restored);
        assert_eq!(restored.restored_path, folder);
        assert_eq!(fs::read(folder.join("report.txt")).unwrap(), b"quarterly numbers");
        assert_eq!(fs::read(folder.join("nested/big.bin")).unwrap(), vec![7u8; 1000]);
        assert_eq!(fs::read(folder.join("empty")).unwrap(), b"");

        let after = preserve_folder_metadata(&folder).unwrap();
        assert_eq!(after.root.mode, before.root.mode);
        assert_eq!(after.root.modified, before.root.modified);
        for (a, b) in after.entries.iter().zip(before.entries.iter()) {
            assert_eq!(a.relative_path, b.relative_path);
            assert_eq!(a.attributes.mode, b.attributes.mode);
            assert_eq!(a.attributes.modified, b.attributes.modified);
        }

        // Temporary unlock keeps the vault copy.
        assert!(hidden.backup_location.is_dir());
    }

    #[test]
    fn test_create_vault_structure_is_idempotent() {
        let fx = Fixture::new();
        let owner = ProfileId::new("alice").unwrap();
        let first = fx.handler.get_vault_structure(&fx.vault_id).unwrap();
        let again = fx
            .handler
            .create_vault_structure(&fx.vault_id, &owner)
            .unwrap();
        assert_eq!(first.created_at, again.created_at);

        let intruder = ProfileId::new("mallory").unwrap();
        assert!(matches!(
            fx.handler.create_vault_structure(&fx.vault_id, &intruder),
            Err(Error::NotPermitted(_))
        ));
    }

    #[test]
    fn test_unknown_vault_not_found() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let missing = VaultId::new("nobody").unwrap();
        assert!(matches!(
            fx.handler.hide_folder(&folder, &missing, &fx.master),
            Err(Error::NotFound(_))
        ));
        assert!(folder.exists());
    }

    #[test]
    fn test_placeholder_fallback_without_privilege() {
        let fx = Fixture::with(VaultConfig::default(), Arc::new(Restricted));
        let folder = fx.folder();

        let hidden = fx.hide(&folder);
        assert_eq!(hidden.hide_method, HideMethod::Placeholder);
        assert!(hidden.fallback_used);
        assert!(platform::is_placeholder(&folder));

        fx.handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();
        assert!(!platform::is_placeholder(&folder));
        assert_eq!(fs::read(folder.join("report.txt")).unwrap(), b"quarterly numbers");
    }

    #[test]
    fn test_forced_removal_without_privilege_leaves_everything() {
        let config = VaultConfig {
            hide_strategy: HideStrategy::Remove,
            ..VaultConfig::default()
        };
        let fx = Fixture::with(config, Arc::new(Restricted));
        let folder = fx.folder();

        assert!(matches!(
            fx.handler.hide_folder(&folder, &fx.vault_id, &fx.master),
            Err(Error::Privilege(_))
        ));
        assert_eq!(fs::read(folder.join("report.txt")).unwrap(), b"quarterly numbers");
        assert!(fx.handler.list_vault_folders(&fx.vault_id).unwrap().is_empty());
        let temp = fx.handler.layout(&fx.vault_id).temp();
        assert_eq!(fs::read_dir(temp).unwrap().count(), 0);
    }

    /// Deletes one file of the folder when asked whether it may be removed,
    /// which happens after metadata capture and before encryption.
    struct LosesFileOnCheck(&'static str);

    impl Platform for LosesFileOnCheck {
        fn is_elevated(&self) -> bool {
            false
        }

        fn can_remove(&self, path: &Path) -> bool {
            let _ = fs::remove_file(path.join(self.0));
            true
        }
    }

    #[test]
    fn test_interrupted_encryption_leaves_no_partial_state() {
        let fx = Fixture::with(VaultConfig::default(), Arc::new(LosesFileOnCheck("report.txt")));
        let folder = fx.folder();

        // empty and nested/big.bin are staged before report.txt fails.
        assert!(fx
            .handler
            .hide_folder(&folder, &fx.vault_id, &fx.master)
            .is_err());

        assert!(folder.is_dir());
        assert_eq!(fs::read(folder.join("empty")).unwrap(), b"");
        assert_eq!(fs::read(folder.join("nested/big.bin")).unwrap(), vec![7u8; 1000]);
        assert!(fx.handler.list_vault_folders(&fx.vault_id).unwrap().is_empty());
        let layout = fx.handler.layout(&fx.vault_id);
        assert_eq!(fs::read_dir(layout.hidden()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(layout.temp()).unwrap().count(), 0);
        assert!(!layout.snapshot().exists());

        let failures = fx.handler.security.security_events(&EventFilter {
            event_type: Some(SecurityEventType::EncryptionFailure),
            ..EventFilter::default()
        });
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_hide_twice_rejected() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);
        fx.handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();

        assert!(matches!(
            fx.handler.hide_folder(&folder, &fx.vault_id, &fx.master),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_wrong_key_keeps_vault_copy() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);

        let result = fx.handler.restore_folder(
            &fx.vault_id,
            &hidden.folder_id,
            &Passphrase::new("not-the-key"),
        );
        assert!(matches!(result, Err(Error::Crypto(_))));
        assert!(!folder.exists());
        assert!(fx.handler.validate_vault_integrity(&fx.vault_id).unwrap());
    }

    #[test]
    fn test_restore_refuses_occupied_path() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("new.txt"), b"someone else's").unwrap();

        assert!(matches!(
            fx.handler
                .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(fs::read(folder.join("new.txt")).unwrap(), b"someone else's");
    }

    #[test]
    fn test_corruption_recovered_from_snapshot() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);

        fs::write(stored_file(&fx, &hidden.folder_id), b"garbage").unwrap();
        assert!(!fx.handler.validate_vault_integrity(&fx.vault_id).unwrap());

        fx.handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();
        assert_eq!(fs::read(folder.join("nested/big.bin")).unwrap(), vec![7u8; 1000]);
        assert!(fx.handler.validate_vault_integrity(&fx.vault_id).unwrap());
    }

    #[test]
    fn test_unrecoverable_corruption_is_data_loss() {
        let config = VaultConfig {
            snapshot_on_change: false,
            ..VaultConfig::default()
        };
        let fx = Fixture::with(config, Arc::new(NativePlatform));
        let folder = fx.folder();
        let hidden = fx.hide(&folder);

        fs::write(stored_file(&fx, &hidden.folder_id), b"garbage").unwrap();
        assert!(matches!(
            fx.handler
                .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master),
            Err(Error::DataLoss(_))
        ));
        let quarantine = fx.handler.layout(&fx.vault_id).backup().join("quarantine");
        assert_eq!(fs::read_dir(quarantine).unwrap().count(), 1);
        assert!(!folder.exists());
    }

    #[test]
    fn test_recovery_keeps_folders_locked_after_snapshot() {
        let fx = Fixture::new();
        let docs = fx.folder();
        let taxes = fx.folder_named("taxes");
        let docs_hidden = fx.hide(&docs);
        let taxes_hidden = fx.hide(&taxes);

        // The snapshot refresh after this lock is refused while docs is
        // corrupted, so photos only exists in the live store.
        fs::write(stored_file(&fx, &docs_hidden.folder_id), b"garbage").unwrap();
        let photos = fx.folder_named("photos");
        let photos_hidden = fx.hide(&photos);
        let layout = fx.handler.layout(&fx.vault_id);
        assert!(!layout
            .snapshot()
            .join(HIDDEN_DIR)
            .join(photos_hidden.folder_id.as_str())
            .exists());

        fx.handler
            .restore_folder(&fx.vault_id, &docs_hidden.folder_id, &fx.master)
            .unwrap();
        assert_eq!(fs::read(docs.join("report.txt")).unwrap(), b"quarterly numbers");

        assert!(layout.hidden_folder(&photos_hidden.folder_id).is_dir());
        assert!(layout.metadata_file(&photos_hidden.folder_id).is_file());
        assert_eq!(fx.handler.list_vault_folders(&fx.vault_id).unwrap().len(), 3);
        assert!(fx.handler.validate_vault_integrity(&fx.vault_id).unwrap());

        fx.handler
            .restore_folder(&fx.vault_id, &photos_hidden.folder_id, &fx.master)
            .unwrap();
        assert_eq!(fs::read(photos.join("nested/big.bin")).unwrap(), vec![7u8; 1000]);
        fx.handler
            .restore_folder(&fx.vault_id, &taxes_hidden.folder_id, &fx.master)
            .unwrap();
        assert_eq!(fs::read(taxes.join("report.txt")).unwrap(), b"quarterly numbers");
    }

    #[test]
    fn test_stale_snapshot_not_restored_over_rotated_folder() {
        let fx = Fixture::new();
        let docs = fx.folder();
        let taxes = fx.folder_named("taxes");
        let docs_hidden = fx.hide(&docs);
        let taxes_hidden = fx.hide(&taxes);

        // Corrupting taxes blocks the snapshot refresh after the rotation,
        // leaving the snapshot with docs under the old salt.
        fs::write(stored_file(&fx, &taxes_hidden.folder_id), b"garbage").unwrap();
        let new_master = Passphrase::new("M2");
        fx.handler
            .reencrypt_folder(&fx.vault_id, &docs_hidden.folder_id, &fx.master, &new_master)
            .unwrap();
        let rotated = fx
            .handler
            .load_folder_metadata(&fx.vault_id, &docs_hidden.folder_id)
            .unwrap();
        fs::write(stored_file(&fx, &docs_hidden.folder_id), b"garbage").unwrap();

        assert!(matches!(
            fx.handler
                .restore_folder(&fx.vault_id, &docs_hidden.folder_id, &new_master),
            Err(Error::DataLoss(_))
        ));
        let after = fx
            .handler
            .load_folder_metadata(&fx.vault_id, &docs_hidden.folder_id)
            .unwrap();
        assert_eq!(after.folder_salt, rotated.folder_salt);
        assert_eq!(after.content_checksum, rotated.content_checksum);

        // taxes was unchanged since the snapshot and came back from it.
        fx.handler
            .restore_folder(&fx.vault_id, &taxes_hidden.folder_id, &fx.master)
            .unwrap();
        assert_eq!(fs::read(taxes.join("report.txt")).unwrap(), b"quarterly numbers");
    }

    #[test]
    fn test_secure_delete_removes_every_copy() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);
        fx.handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();

        let cleaned = fx
            .handler
            .secure_delete_from_vault(&fx.vault_id, &hidden.folder_id)
            .unwrap();
        assert_eq!(cleaned.folders_cleaned, 1);
        assert!(cleaned.bytes_freed > 0);

        let layout = fx.handler.layout(&fx.vault_id);
        assert!(!layout.hidden_folder(&hidden.folder_id).exists());
        assert!(!layout.snapshot().join("hidden").join(hidden.folder_id.as_str()).exists());
        assert!(fx.handler.list_vault_folders(&fx.vault_id).unwrap().is_empty());
        assert!(fx.handler.validate_vault_integrity(&fx.vault_id).unwrap());
        assert!(matches!(
            fx.handler.secure_delete_from_vault(&fx.vault_id, &hidden.folder_id),
            Err(Error::NotFound(_))
        ));
        assert!(folder.join("report.txt").exists());
    }

    #[test]
    fn test_relock_captures_changes() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);
        fx.handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();
        fs::write(folder.join("report.txt"), b"revised numbers").unwrap();

        fx.handler
            .relock_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();
        assert!(!folder.exists());

        fx.handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .unwrap();
        assert_eq!(fs::read(folder.join("report.txt")).unwrap(), b"revised numbers");
    }

    #[test]
    fn test_relock_requires_unlocked_folder() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);
        assert!(matches!(
            fx.handler
                .relock_folder(&fx.vault_id, &hidden.folder_id, &fx.master),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_reencrypt_rotates_key() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);
        let new_master = Passphrase::new("M2");

        fx.handler
            .reencrypt_folder(&fx.vault_id, &hidden.folder_id, &fx.master, &new_master)
            .unwrap();

        assert!(fx
            .handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &fx.master)
            .is_err());
        fx.handler
            .restore_folder(&fx.vault_id, &hidden.folder_id, &new_master)
            .unwrap();
        assert_eq!(fs::read(folder.join("report.txt")).unwrap(), b"quarterly numbers");
        let temp = fx.handler.layout(&fx.vault_id).temp();
        assert_eq!(fs::read_dir(temp).unwrap().count(), 0);
    }

    #[test]
    fn test_reencrypt_with_wrong_key_changes_nothing() {
        let fx = Fixture::new();
        let folder = fx.folder();
        let hidden = fx.hide(&folder);
        let before = fx
            .handler
            .load_folder_metadata(&fx.vault_id, &hidden.folder_id)
            .unwrap();

        assert!(fx
            .handler
            .reencrypt_folder(
                &fx.vault_id,
                &hidden.folder_id,
                &Passphrase::new("wrong"),
                &Passphrase::new("M2"),
            )
            .is_err());
        let after = fx
            .handler
            .load_folder_metadata(&fx.vault_id, &hidden.folder_id)
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_cleanup_temp_area_removes_orphans() {
        let fx = Fixture::new();
        let temp = fx.handler.layout(&fx.vault_id).temp();
        fs::create_dir_all(temp.join("seal-orphan")).unwrap();
        fs::write(temp.join("seal-orphan/0.enc"), b"partial").unwrap();

        assert_eq!(fx.handler.cleanup_temp_area(&fx.vault_id).unwrap(), 1);
        assert_eq!(fs::read_dir(temp).unwrap().count(), 0);
    }

    #[test]
    fn test_vault_storage_cannot_be_hidden() {
        let fx = Fixture::new();
        let vaults = fx.dir.path().join("data/vaults");
        assert!(matches!(
            fx.handler.hide_folder(&vaults, &fx.vault_id, &fx.master),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_delete_vault_removes_everything() {
        let fx = Fixture::new();
        let folder = fx.folder();
        fx.hide(&folder);
        let root = fx.handler.vault_path(&fx.vault_id);

        let result = fx.handler.delete_vault(&fx.vault_id).unwrap();
        assert_eq!(result.folders_cleaned, 1);
        assert!(!root.exists());
        assert!(matches!(
            fx.handler.delete_vault(&fx.vault_id),
            Err(Error::NotFound(_))
        ));
    }
}
