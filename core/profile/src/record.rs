//! Persisted profile records.
//!
//! Each profile is one JSON file under `profiles/`. Records hold only salted
//! verifiers and sealed blobs: neither the master key nor the recovery key
//! is ever written in the clear.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use veilvault_common::{Error, FolderId, ProfileId, Result};
use veilvault_crypto::SealedSecret;
use veilvault_security::backup::create_private_dir;
use veilvault_vault::shred;
use veilvault_vault::{read_json, write_json_atomic};

/// Lock state of a tracked folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderState {
    /// Only the vault copy exists.
    Locked,
    /// Restored to its original location; the vault copy is retained.
    UnlockedTemporary,
}

/// A folder owned by a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub folder_id: FolderId,
    pub original_path: PathBuf,
    pub state: FolderState,
    pub locked_at: DateTime<Utc>,
    /// Previous master key, sealed under the current one, while the vault
    /// copy still awaits re-encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_key: Option<SealedSecret>,
}

/// The stored form of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: ProfileId,
    pub name: String,
    /// Argon2id PHC string of the master key.
    pub master_key_hash: String,
    /// Argon2id PHC string of the canonical recovery key.
    pub recovery_key_hash: String,
    /// Recovery key sealed under the master key.
    pub encrypted_recovery_key: SealedSecret,
    /// Master key sealed under the recovery key.
    pub master_key_encrypted_with_recovery_key: SealedSecret,
    pub created_at: DateTime<Utc>,
    pub last_access: Option<DateTime<Utc>>,
    #[serde(default)]
    pub folders: Vec<FolderEntry>,
}

impl ProfileRecord {
    pub fn folder(&self, folder_id: &FolderId) -> Option<&FolderEntry> {
        self.folders.iter().find(|f| &f.folder_id == folder_id)
    }

    pub fn folder_mut(&mut self, folder_id: &FolderId) -> Option<&mut FolderEntry> {
        self.folders.iter_mut().find(|f| &f.folder_id == folder_id)
    }

    pub fn has_locked_folders(&self) -> bool {
        self.folders.iter().any(|f| f.state == FolderState::Locked)
    }

    /// Public view of this record.
    pub fn summary(&self, is_active: bool) -> ProfileSummary {
        ProfileSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            last_access: self.last_access,
            folder_count: self.folders.len(),
            is_active,
        }
    }
}

/// Profile details safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: ProfileId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_access: Option<DateTime<Utc>>,
    pub folder_count: usize,
    pub is_active: bool,
}

/// Folder details safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSummary {
    pub folder_id: FolderId,
    pub original_path: PathBuf,
    pub state: FolderState,
    pub locked_at: DateTime<Utc>,
    pub awaiting_reencryption: bool,
}

impl From<&FolderEntry> for FolderSummary {
    fn from(entry: &FolderEntry) -> Self {
        Self {
            folder_id: entry.folder_id.clone(),
            original_path: entry.original_path.clone(),
            state: entry.state,
            locked_at: entry.locked_at,
            awaiting_reencryption: entry.legacy_key.is_some(),
        }
    }
}

/// Directory of profile records.
pub struct ProfileStore {
    dir: PathBuf,
    overwrite_passes: u32,
}

impl ProfileStore {
    /// Open (creating if needed) the store at `dir`.
    pub fn open(dir: impl Into<PathBuf>, overwrite_passes: u32) -> Result<Self> {
        let dir = dir.into();
        create_private_dir(&dir)?;
        Ok(Self {
            dir,
            overwrite_passes,
        })
    }

    pub fn path_for(&self, id: &ProfileId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_str()))
    }

    pub fn exists(&self, id: &ProfileId) -> bool {
        self.path_for(id).exists()
    }

    /// # Errors
    /// - `NotFound` for an unknown profile
    pub fn load(&self, id: &ProfileId) -> Result<ProfileRecord> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("Profile not found: {}", id)));
        }
        read_json(&path)
    }

    pub fn save(&self, record: &ProfileRecord) -> Result<()> {
        write_json_atomic(&self.path_for(&record.id), record)
    }

    /// Atomically replace a record and scrub the bytes of the version it
    /// replaced.
    pub fn replace_scrubbed(&self, record: &ProfileRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        let previous = match fs::metadata(&path) {
            Ok(meta) => Some((OpenOptions::new().write(true).open(&path)?, meta.len())),
            Err(_) => None,
        };
        write_json_atomic(&path, record)?;
        if let Some((mut file, len)) = previous {
            if let Err(e) = shred::overwrite_open_file(&mut file, len, self.overwrite_passes) {
                warn!(profile_id = %record.id, error = %e, "Previous profile record not scrubbed");
            }
        }
        Ok(())
    }

    /// All readable records, ordered by creation time.
    pub fn list(&self) -> Result<Vec<ProfileRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !is_record_file(&path) {
                continue;
            }
            match read_json::<ProfileRecord>(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable profile"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Overwrite and remove a record.
    pub fn delete(&self, id: &ProfileId) -> Result<()> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("Profile not found: {}", id)));
        }
        shred::shred_tree(&path, self.overwrite_passes)?;
        Ok(())
    }
}

fn is_record_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    !name.starts_with('.') && name.ends_with(".json")
}
