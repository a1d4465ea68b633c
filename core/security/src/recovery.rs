//! Vault recovery after detected corruption.
//!
//! Recovery works one folder at a time. Only folders with damaged files
//! are touched, and a folder is restored from the vault snapshot only when
//! the verifier confirms the snapshot holds the same version of it.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::backup::{copy_tree, remove_path, SNAPSHOT_DIR};
use veilvault_common::{Error, Result};

/// Vault subdirectories covered by snapshots and recovery.
pub const HIDDEN_DIR: &str = "hidden";
pub const METADATA_DIR: &str = "metadata";
pub const BACKUP_DIR: &str = "backup";
const QUARANTINE_DIR: &str = "quarantine";

/// Outcome of a recovery attempt. Paths are relative to the vault root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub success: bool,
    /// Folders whose damaged copy was replaced from the vault snapshot.
    pub snapshot_folders: Vec<String>,
    pub recovered_files: Vec<String>,
    pub failed_files: Vec<String>,
}

impl RecoveryReport {
    /// Some files were recovered and some were not.
    pub fn is_partial(&self) -> bool {
        !self.failed_files.is_empty() && !self.recovered_files.is_empty()
    }
}

/// Judges stored content during recovery.
pub trait FileVerifier {
    /// Whether one stored file is intact. Called for ciphertext under
    /// `hidden/` and for folder records under `metadata/`.
    fn verify(&self, path: &Path) -> bool;

    /// Whether the snapshot's copy of `folder` is the same version as the
    /// live one, so it may replace the live copy.
    fn snapshot_matches(&self, _folder: &str, _snapshot: &Path) -> bool {
        false
    }
}

impl<F: Fn(&Path) -> bool> FileVerifier for F {
    fn verify(&self, path: &Path) -> bool {
        self(path)
    }
}

/// A file is plausibly intact if it can be read and is not empty.
pub fn readable_and_non_empty(path: &Path) -> bool {
    fs::File::open(path).is_ok() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Recover a vault directory.
///
/// Every folder found under `hidden/` or `metadata/` is checked with
/// `verifier`. Intact folders are left alone. A damaged folder is replaced
/// from `backup/vault_snapshot` when the verifier accepts the snapshot's
/// copy; otherwise its corrupted ciphertext files are moved into
/// `backup/quarantine/` so the remaining files stay usable.
///
/// # Postconditions
/// - `success` is true only when no file failed
/// - Folders absent from the snapshot are never removed
/// - Partial success is reported rather than failing the whole vault
pub fn recover_vault(vault_path: &Path, verifier: &dyn FileVerifier) -> Result<RecoveryReport> {
    if !vault_path.is_dir() {
        return Err(Error::NotFound(format!(
            "Vault directory missing: {}",
            vault_path.display()
        )));
    }

    let snapshot = vault_path.join(BACKUP_DIR).join(SNAPSHOT_DIR);
    let mut report = RecoveryReport::default();
    for folder in folder_names(vault_path)? {
        let mut damage = inspect_folder(vault_path, &folder, verifier);
        if damage.is_clean() {
            report.recovered_files.extend(damage.intact);
            continue;
        }

        if snapshot.is_dir() && verifier.snapshot_matches(&folder, &snapshot) {
            restore_folder_from_snapshot(vault_path, &snapshot, &folder)?;
            info!(folder = %folder, "Folder restored from snapshot");
            report.snapshot_folders.push(folder.clone());
            damage = inspect_folder(vault_path, &folder, verifier);
        }

        quarantine(vault_path, &damage.corrupted)?;
        report.recovered_files.extend(damage.intact);
        report.failed_files.extend(damage.corrupted);
        report.failed_files.extend(damage.bad_record);
    }
    report.success = report.failed_files.is_empty();

    info!(
        vault = %vault_path.display(),
        from_snapshot = report.snapshot_folders.len(),
        recovered = report.recovered_files.len(),
        failed = report.failed_files.len(),
        "Vault recovery finished"
    );
    Ok(report)
}

/// Verification state of one folder. Paths are relative to the vault.
struct FolderDamage {
    intact: Vec<String>,
    corrupted: Vec<String>,
    bad_record: Option<String>,
}

impl FolderDamage {
    fn is_clean(&self) -> bool {
        self.corrupted.is_empty() && self.bad_record.is_none()
    }
}

fn inspect_folder(vault_path: &Path, folder: &str, verifier: &dyn FileVerifier) -> FolderDamage {
    let mut damage = FolderDamage {
        intact: Vec::new(),
        corrupted: Vec::new(),
        bad_record: None,
    };
    for path in files_under(&vault_path.join(HIDDEN_DIR).join(folder)) {
        let relative = relative_name(vault_path, &path);
        if verifier.verify(&path) {
            damage.intact.push(relative);
        } else {
            damage.corrupted.push(relative);
        }
    }
    let record = vault_path.join(METADATA_DIR).join(format!("{}.json", folder));
    if record.exists() && !verifier.verify(&record) {
        damage.bad_record = Some(relative_name(vault_path, &record));
    }
    damage
}

/// Replace one folder's ciphertext and record with the snapshot's copy.
fn restore_folder_from_snapshot(vault_path: &Path, snapshot: &Path, folder: &str) -> Result<()> {
    let saved = snapshot.join(HIDDEN_DIR).join(folder);
    if saved.is_dir() {
        let hidden = vault_path.join(HIDDEN_DIR).join(folder);
        let incoming = vault_path
            .join(HIDDEN_DIR)
            .join(format!(".{}.restoring", folder));
        remove_path(&incoming)?;
        copy_tree(&saved, &incoming)?;
        remove_path(&hidden)?;
        fs::rename(&incoming, &hidden)?;
    }

    let record = format!("{}.json", folder);
    let snapshot_record = snapshot.join(METADATA_DIR).join(&record);
    if snapshot_record.is_file() {
        let live_record = vault_path.join(METADATA_DIR).join(&record);
        let staged = vault_path
            .join(METADATA_DIR)
            .join(format!(".{}.restoring", record));
        fs::copy(&snapshot_record, &staged)?;
        fs::rename(&staged, &live_record)?;
    }
    Ok(())
}

fn quarantine(vault_path: &Path, corrupted: &[String]) -> Result<()> {
    let quarantine = vault_path.join(BACKUP_DIR).join(QUARANTINE_DIR);
    for relative in corrupted {
        let path = vault_path.join(relative);
        warn!(file = %relative, "Corrupted vault file quarantined");
        let dest = quarantine.join(relative.replace('/', "__"));
        fs::create_dir_all(&quarantine)?;
        if fs::rename(&path, &dest).is_err() {
            remove_path(&path)?;
        }
    }
    Ok(())
}

/// Folder names present in either the hidden store or the metadata store.
fn folder_names(vault_path: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let hidden = vault_path.join(HIDDEN_DIR);
    if hidden.is_dir() {
        for entry in fs::read_dir(&hidden)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                names.insert(name);
            }
        }
    }
    let metadata = vault_path.join(METADATA_DIR);
    if metadata.is_dir() {
        for entry in fs::read_dir(&metadata)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".json") {
                names.insert(stem.to_string());
            }
        }
    }
    Ok(names)
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault(root: &Path) -> PathBuf {
        let vault = root.join("vault");
        fs::create_dir_all(vault.join("hidden/f1")).unwrap();
        fs::create_dir_all(vault.join("metadata")).unwrap();
        fs::write(vault.join("hidden/f1/0.enc"), b"good-ciphertext").unwrap();
        fs::write(vault.join("hidden/f1/1.enc"), b"").unwrap();
        fs::write(vault.join("metadata/f1.json"), b"{}").unwrap();
        vault
    }

    #[test]
    fn test_per_file_recovery_reports_partial_success() {
        let dir = TempDir::new().unwrap();
        let vault = vault(dir.path());

        let report = recover_vault(&vault, &readable_and_non_empty).unwrap();

        assert!(!report.success);
        assert!(report.is_partial());
        assert!(report.snapshot_folders.is_empty());
        assert_eq!(report.recovered_files, vec!["hidden/f1/0.enc".to_string()]);
        assert_eq!(report.failed_files, vec!["hidden/f1/1.enc".to_string()]);
        assert!(!vault.join("hidden/f1/1.enc").exists());
        assert!(vault.join("backup/quarantine").read_dir().unwrap().count() == 1);
    }

    #[test]
    fn test_custom_verifier() {
        let dir = TempDir::new().unwrap();
        let vault = vault(dir.path());

        let reject_all = |_: &Path| false;
        let report = recover_vault(&vault, &reject_all).unwrap();
        assert!(report.recovered_files.is_empty());
        assert_eq!(
            report.failed_files,
            vec![
                "hidden/f1/0.enc".to_string(),
                "hidden/f1/1.enc".to_string(),
                "metadata/f1.json".to_string(),
            ]
        );
        assert!(vault.join("metadata/f1.json").exists());
        assert!(!report.is_partial());
    }

    /// Accepts snapshot copies only for the named folders.
    struct SnapshotFor(&'static [&'static str]);

    impl FileVerifier for SnapshotFor {
        fn verify(&self, path: &Path) -> bool {
            readable_and_non_empty(path)
        }

        fn snapshot_matches(&self, folder: &str, _snapshot: &Path) -> bool {
            self.0.contains(&folder)
        }
    }

    fn snapshot_of_f1(vault: &Path) -> PathBuf {
        let snapshot = vault.join("backup/vault_snapshot");
        fs::create_dir_all(snapshot.join("hidden/f1")).unwrap();
        fs::create_dir_all(snapshot.join("metadata")).unwrap();
        fs::write(snapshot.join("hidden/f1/0.enc"), b"snap-0").unwrap();
        fs::write(snapshot.join("hidden/f1/1.enc"), b"snap-1").unwrap();
        fs::write(snapshot.join("metadata/f1.json"), b"{\"snap\":true}").unwrap();
        snapshot
    }

    #[test]
    fn test_damaged_folder_restored_from_matching_snapshot() {
        let dir = TempDir::new().unwrap();
        let vault = vault(dir.path());
        let snapshot = snapshot_of_f1(&vault);

        let report = recover_vault(&vault, &SnapshotFor(&["f1"])).unwrap();

        assert!(report.success);
        assert_eq!(report.snapshot_folders, vec!["f1".to_string()]);
        assert_eq!(report.recovered_files.len(), 2);
        assert_eq!(fs::read(vault.join("hidden/f1/1.enc")).unwrap(), b"snap-1");
        assert_eq!(fs::read(vault.join("metadata/f1.json")).unwrap(), b"{\"snap\":true}");
        assert!(snapshot.join("hidden/f1/0.enc").exists());
        assert!(!vault.join("hidden/.f1.restoring").exists());
    }

    #[test]
    fn test_mismatched_snapshot_falls_back_to_quarantine() {
        let dir = TempDir::new().unwrap();
        let vault = vault(dir.path());
        snapshot_of_f1(&vault);

        let report = recover_vault(&vault, &SnapshotFor(&[])).unwrap();

        assert!(!report.success);
        assert!(report.snapshot_folders.is_empty());
        assert_eq!(fs::read(vault.join("hidden/f1/0.enc")).unwrap(), b"good-ciphertext");
        assert_eq!(fs::read(vault.join("metadata/f1.json")).unwrap(), b"{}");
        assert_eq!(report.failed_files, vec!["hidden/f1/1.enc".to_string()]);
    }

    #[test]
    fn test_folders_outside_snapshot_survive() {
        let dir = TempDir::new().unwrap();
        let vault = vault(dir.path());
        snapshot_of_f1(&vault);
        fs::create_dir_all(vault.join("hidden/f2")).unwrap();
        fs::write(vault.join("hidden/f2/0.enc"), b"newer-folder").unwrap();
        fs::write(vault.join("metadata/f2.json"), b"{}").unwrap();

        let report = recover_vault(&vault, &SnapshotFor(&["f1"])).unwrap();

        assert!(report.success);
        assert_eq!(report.snapshot_folders, vec!["f1".to_string()]);
        assert_eq!(fs::read(vault.join("hidden/f2/0.enc")).unwrap(), b"newer-folder");
        assert!(vault.join("metadata/f2.json").exists());
        assert!(report.recovered_files.contains(&"hidden/f2/0.enc".to_string()));
    }

    #[test]
    fn test_missing_vault() {
        let dir = TempDir::new().unwrap();
        assert!(recover_vault(&dir.path().join("nope"), &readable_and_non_empty).is_err());
    }
}
