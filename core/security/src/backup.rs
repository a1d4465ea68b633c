//! Scoped backup of files and directories.
//!
//! [`ScopedBackup`] copies its target aside when created. Dropping it
//! without calling [`ScopedBackup::commit`] puts the original back, so an
//! early return or `?` anywhere in a destructive operation rolls the
//! target back to its pre-operation state.

use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use veilvault_common::{Error, Result};

/// Name of the vault-level snapshot directory inside a backup area.
pub const SNAPSHOT_DIR: &str = "vault_snapshot";

/// Guard holding a backup of one path until committed.
#[derive(Debug)]
pub struct ScopedBackup {
    target: PathBuf,
    backup: Option<PathBuf>,
    armed: bool,
}

impl ScopedBackup {
    /// Back up `target` into a fresh entry under `backup_root`.
    ///
    /// A target that does not exist yet is recorded as absent; rolling back
    /// then removes whatever was created at that path.
    ///
    /// # Errors
    /// - I/O errors while copying; no partial backup is left behind
    pub fn new(target: impl AsRef<Path>, backup_root: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let backup_root = backup_root.as_ref();
        create_private_dir(backup_root)?;

        let backup = if fs::symlink_metadata(&target).is_ok() {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "root".to_string());
            let path = backup_root.join(format!("{}-{}", name, Uuid::new_v4().simple()));
            if let Err(e) = copy_tree(&target, &path) {
                let _ = remove_path(&path);
                return Err(e);
            }
            Some(path)
        } else {
            None
        };

        debug!(
            target = %target.display(),
            existed = backup.is_some(),
            "Scoped backup taken"
        );
        Ok(Self {
            target,
            backup,
            armed: true,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Location of the backup copy, if the target existed.
    pub fn backup_path(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    /// Keep the mutated target and discard the backup.
    pub fn commit(mut self) -> Result<()> {
        self.armed = false;
        if let Some(backup) = &self.backup {
            remove_path(backup)?;
        }
        debug!(target = %self.target.display(), "Scoped backup committed");
        Ok(())
    }

    /// Roll back immediately and report the outcome.
    pub fn restore_now(mut self) -> Result<()> {
        self.armed = false;
        self.restore()
    }

    fn restore(&self) -> Result<()> {
        if fs::symlink_metadata(&self.target).is_ok() {
            remove_path(&self.target)?;
        }
        if let Some(backup) = &self.backup {
            move_tree(backup, &self.target)?;
        }
        Ok(())
    }
}

impl Drop for ScopedBackup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.restore() {
            Ok(()) => warn!(target = %self.target.display(), "Operation rolled back from backup"),
            Err(e) => error!(
                target = %self.target.display(),
                backup = ?self.backup,
                error = %e,
                "Rollback failed; backup left in place"
            ),
        }
    }
}

/// Create a directory readable only by its owner.
pub fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Copy a file or directory tree, keeping permission bits and timestamps.
///
/// Directory permissions are applied after their contents are copied so
/// read-only directories can still be populated.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        return copy_entry(src, dst, &meta);
    }

    let mut dirs = Vec::new();
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(walk_error(e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Vault(e.to_string()))?;
        let out = dst.join(relative);
        let meta = entry.metadata().map_err(|e| Error::Io(walk_error(e)))?;
        if meta.is_dir() {
            fs::create_dir_all(&out)?;
            dirs.push((out, meta));
        } else {
            copy_entry(entry.path(), &out, &meta)?;
        }
    }

    for (dir, meta) in dirs.iter().rev() {
        fs::set_permissions(dir, meta.permissions())?;
        apply_times(dir, meta);
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path, meta: &fs::Metadata) -> Result<()> {
    if meta.file_type().is_symlink() {
        #[cfg(unix)]
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
        return Ok(());
    }
    fs::copy(src, dst)?;
    apply_times(dst, meta);
    Ok(())
}

fn apply_times(path: &Path, meta: &fs::Metadata) {
    let (Ok(accessed), Ok(modified)) = (meta.accessed(), meta.modified()) else {
        return;
    };
    let result = File::open(path)
        .and_then(|f| f.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified)));
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "Could not preserve timestamps");
    }
}

fn walk_error(e: walkdir::Error) -> io::Error {
    e.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop detected"))
}

/// Move a tree, falling back to copy-and-delete across filesystems.
pub fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            remove_path(src)
        }
    }
}

/// Remove a file or directory tree, first granting the owner write access
/// to every directory so read-only trees can be removed.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        fs::remove_file(path)?;
        return Ok(());
    }
    make_owner_writable(path);
    fs::remove_dir_all(path)?;
    Ok(())
}

fn make_owner_writable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
        for entry in WalkDir::new(path).min_depth(1).into_iter().flatten() {
            if entry.file_type().is_dir() {
                let mode = entry
                    .metadata()
                    .map(|m| m.permissions().mode())
                    .unwrap_or(0o700);
                let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700));
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Delete backup entries under `backup_root` older than `max_age`.
/// The vault snapshot is never removed here.
pub fn cleanup_backups(backup_root: &Path, max_age: Duration) -> Result<usize> {
    if !backup_root.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(backup_root)? {
        let entry = entry?;
        if entry.file_name() == SNAPSHOT_DIR {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= max_age {
            remove_path(&entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(removed, "Old backups removed");
    }
    Ok(removed)
}
