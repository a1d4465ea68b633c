//! On-disk vault layout and structure manifest.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use veilvault_common::{Error, FolderId, ProfileId, Result, VaultId};
use veilvault_security::backup::SNAPSHOT_DIR;
use veilvault_security::recovery::{BACKUP_DIR, HIDDEN_DIR, METADATA_DIR};

/// Structure manifest file name in the vault root.
pub const MANIFEST_FILENAME: &str = "vault_structure.json";

/// Staging area name in the vault root.
pub const TEMP_DIR: &str = "temp";

/// Vault format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultVersion {
    pub major: u32,
    pub minor: u32,
}

impl VaultVersion {
    /// Current vault format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for VaultVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Structure manifest stored at the vault root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStructure {
    pub vault_id: VaultId,
    pub profile_id: ProfileId,
    pub version: VaultVersion,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Paths inside one vault directory.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(vaults_root: &Path, vault_id: &VaultId) -> Self {
        Self {
            root: vaults_root.join(vault_id.as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILENAME)
    }

    pub fn hidden(&self) -> PathBuf {
        self.root.join(HIDDEN_DIR)
    }

    /// Ciphertext directory for one folder.
    pub fn hidden_folder(&self, folder_id: &FolderId) -> PathBuf {
        self.hidden().join(folder_id.as_str())
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    pub fn metadata_file(&self, folder_id: &FolderId) -> PathBuf {
        self.metadata_dir().join(format!("{}.json", folder_id.as_str()))
    }

    pub fn temp(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn backup(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    pub fn snapshot(&self) -> PathBuf {
        self.backup().join(SNAPSHOT_DIR)
    }

    /// The private subdirectories every vault has.
    pub fn directories(&self) -> [PathBuf; 4] {
        [self.hidden(), self.metadata_dir(), self.temp(), self.backup()]
    }
}

/// Write `value` as pretty JSON by way of a synced temporary file and a
/// rename, so readers only ever see a complete document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    drop(file);
    set_private_file(&tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON document written by [`write_json_atomic`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(unix)]
fn set_private_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vault_version_compatibility() {
        assert!(VaultVersion::CURRENT.is_compatible());
        assert!(!VaultVersion { major: 2, minor: 0 }.is_compatible());
    }

    #[test]
    fn test_layout_paths() {
        let layout = VaultLayout::new(Path::new("/data/vaults"), &VaultId::new("v1").unwrap());
        let folder = FolderId::new("abc").unwrap();
        assert_eq!(layout.root(), Path::new("/data/vaults/v1"));
        assert_eq!(layout.hidden_folder(&folder), Path::new("/data/vaults/v1/hidden/abc"));
        assert_eq!(layout.metadata_file(&folder), Path::new("/data/vaults/v1/metadata/abc.json"));
        assert_eq!(layout.snapshot(), Path::new("/data/vaults/v1/backup/vault_snapshot"));
    }

    #[test]
    fn test_atomic_json_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();

        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
