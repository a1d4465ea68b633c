//! Folder metadata capture and restoration.
//!
//! Everything needed to put a folder back exactly as it was: ownership,
//! permission bits, timestamps and `user.` extended attributes for the
//! folder root and every entry below it, plus the per-file encryption
//! parameters.

use std::collections::BTreeMap;
use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use veilvault_common::{Error, FolderId, Result, VaultId};
use veilvault_crypto::encoding;
use veilvault_crypto::{sha256_hex, Iv, Salt};

/// How the original location was left after hiding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HideMethod {
    /// The original directory was removed.
    Removed,
    /// An empty, inaccessible directory was left in place.
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Ownership, permissions, timestamps and extended attributes of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Permission bits (`0o7777` mask on Unix).
    pub mode: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    /// Attribute name to base64 value.
    #[serde(default)]
    pub xattrs: BTreeMap<String, String>,
}

/// Encryption parameters of one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherRecord {
    /// File name under `hidden/<folder_id>/`.
    pub stored_name: String,
    /// Per-file salt mixed into the file subkey.
    #[serde(with = "encoding::b64")]
    pub salt: Vec<u8>,
    pub iv: Iv,
    pub plaintext_len: u64,
    pub plaintext_sha256: String,
    pub ciphertext_sha256: String,
}

/// One file, directory or symlink inside a vaulted folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Path relative to the folder root, `/`-separated.
    pub relative_path: String,
    pub kind: EntryKind,
    pub attributes: FileAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<CipherRecord>,
}

/// Metadata captured from a folder before any destructive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedMetadata {
    pub original_path: PathBuf,
    pub root: FileAttributes,
    pub entries: Vec<EntryMetadata>,
}

impl PreservedMetadata {
    pub fn files(&self) -> impl Iterator<Item = &EntryMetadata> {
        self.entries.iter().filter(|e| e.kind == EntryKind::File)
    }

    /// Total plaintext size of stored files.
    pub fn plaintext_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(|e| e.cipher.as_ref())
            .map(|c| c.plaintext_len)
            .sum()
    }
}

/// Persisted record of a locked folder, stored as
/// `metadata/<folder_id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMetadata {
    pub folder_id: FolderId,
    pub vault_id: VaultId,
    pub hidden_at: DateTime<Utc>,
    pub hide_method: HideMethod,
    /// Salt for re-deriving the folder key from the master key.
    pub folder_salt: Salt,
    /// Digest over every stored file's ciphertext digest.
    pub content_checksum: String,
    #[serde(flatten)]
    pub preserved: PreservedMetadata,
}

impl FolderMetadata {
    pub fn original_path(&self) -> &Path {
        &self.preserved.original_path
    }

    /// Recompute the content checksum from the per-file records.
    pub fn compute_checksum(preserved: &PreservedMetadata) -> String {
        let mut manifest = String::new();
        for entry in &preserved.entries {
            if let Some(cipher) = &entry.cipher {
                manifest.push_str(&entry.relative_path);
                manifest.push(':');
                manifest.push_str(&cipher.ciphertext_sha256);
                manifest.push('\n');
            }
        }
        sha256_hex(manifest.as_bytes())
    }
}

/// Stable folder identifier derived from the canonical original path.
pub fn folder_id_for(path: &Path) -> Result<FolderId> {
    let digest = sha256_hex(path.to_string_lossy().as_bytes());
    FolderId::new(&digest[..32])
}

/// Snapshot the metadata of `path` and everything below it.
///
/// # Preconditions
/// - `path` is an existing directory
///
/// # Errors
/// - `InvalidInput` if `path` is not a directory or contains special files
/// - I/O errors while reading metadata
pub fn preserve_folder_metadata(path: &Path) -> Result<PreservedMetadata> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Not a directory: {}",
            path.display()
        )));
    }

    let root = capture_attributes(path)?;
    let mut entries = Vec::new();
    for entry in WalkDir::new(path)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            return Err(Error::InvalidInput(format!(
                "Unsupported file type: {}",
                entry.path().display()
            )));
        };
        let relative = entry
            .path()
            .strip_prefix(path)
            .map_err(|_| Error::Vault("Entry outside folder root".to_string()))?;
        let link_target = match kind {
            EntryKind::Symlink => Some(fs::read_link(entry.path())?),
            _ => None,
        };

        entries.push(EntryMetadata {
            relative_path: relative_to_string(relative),
            kind,
            attributes: capture_attributes(entry.path())?,
            link_target,
            cipher: None,
        });
    }

    Ok(PreservedMetadata {
        original_path: path.to_path_buf(),
        root,
        entries,
    })
}

/// Resolve a stored relative path under `root`, rejecting traversal.
pub fn join_relative(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for part in relative.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(Error::Integrity(format!("Invalid stored path: {}", relative)));
        }
        path.push(part);
    }
    Ok(path)
}

fn relative_to_string(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Read the attributes of one path without following symlinks.
pub fn capture_attributes(path: &Path) -> Result<FileAttributes> {
    let meta = fs::symlink_metadata(path)?;
    let (uid, gid, mode) = ownership_and_mode(&meta);
    let xattrs = if meta.file_type().is_symlink() {
        BTreeMap::new()
    } else {
        xattr::list(path)?
            .into_iter()
            .map(|(name, value)| (name, STANDARD.encode(value)))
            .collect()
    };

    Ok(FileAttributes {
        uid,
        gid,
        mode,
        created: meta.created().ok().map(DateTime::<Utc>::from),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        accessed: meta.accessed().ok().map(DateTime::<Utc>::from),
        xattrs,
    })
}

/// Reapply captured attributes to `path`.
///
/// Extended attributes and timestamps are written first and permission
/// bits last, so a read-only mode cannot block the other steps. Creation
/// time is recorded but cannot be set on most platforms. Symlinks are left
/// as created.
pub fn apply_attributes(path: &Path, attrs: &FileAttributes) -> Result<()> {
    if fs::symlink_metadata(path)?.file_type().is_symlink() {
        return Ok(());
    }

    for (name, value) in &attrs.xattrs {
        let value = STANDARD
            .decode(value.as_bytes())
            .map_err(|e| Error::Serialization(format!("xattr {}: {}", name, e)))?;
        xattr::set(path, name, &value)?;
    }

    let mut times = FileTimes::new();
    if let Some(accessed) = attrs.accessed {
        times = times.set_accessed(SystemTime::from(accessed));
    }
    if let Some(modified) = attrs.modified {
        times = times.set_modified(SystemTime::from(modified));
    }
    File::open(path)?.set_times(times)?;

    set_ownership(path, attrs)?;
    set_mode(path, attrs.mode)?;
    Ok(())
}

#[cfg(unix)]
fn ownership_and_mode(meta: &fs::Metadata) -> (Option<u32>, Option<u32>, u32) {
    use std::os::unix::fs::MetadataExt;
    (Some(meta.uid()), Some(meta.gid()), meta.mode() & 0o7777)
}

#[cfg(not(unix))]
fn ownership_and_mode(meta: &fs::Metadata) -> (Option<u32>, Option<u32>, u32) {
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o666 };
    (None, None, mode)
}

#[cfg(unix)]
fn set_ownership(path: &Path, attrs: &FileAttributes) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let current = fs::metadata(path)?;
    let uid = attrs.uid.filter(|uid| *uid != current.uid());
    let gid = attrs.gid.filter(|gid| *gid != current.gid());
    if uid.is_some() || gid.is_some() {
        std::os::unix::fs::chown(path, uid, gid)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_ownership(_path: &Path, _attrs: &FileAttributes) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// `user.` namespace extended attributes. Other namespaces need
/// privileges to restore and are not captured.
#[cfg(target_os = "linux")]
pub(crate) mod xattr {
    use std::collections::BTreeMap;
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use veilvault_common::{Error, Result};

    const NAMESPACE: &str = "user.";

    fn c_path(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidInput("Path contains a NUL byte".to_string()))
    }

    fn unsupported(err: &io::Error) -> bool {
        matches!(err.raw_os_error(), Some(libc::ENOTSUP))
    }

    pub fn list(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
        let c_path = c_path(path)?;
        let mut attrs = BTreeMap::new();

        // SAFETY: a null buffer with size 0 queries the required length.
        let size = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let err = io::Error::last_os_error();
            return if unsupported(&err) { Ok(attrs) } else { Err(err.into()) };
        }
        if size == 0 {
            return Ok(attrs);
        }

        let mut names = vec![0u8; size as usize];
        // SAFETY: `names` is valid for `names.len()` bytes.
        let size = unsafe {
            libc::llistxattr(
                c_path.as_ptr(),
                names.as_mut_ptr() as *mut libc::c_char,
                names.len(),
            )
        };
        if size < 0 {
            return Err(io::Error::last_os_error().into());
        }
        names.truncate(size as usize);

        for raw in names.split(|b| *b == 0).filter(|n| !n.is_empty()) {
            let name = String::from_utf8_lossy(raw).into_owned();
            if !name.starts_with(NAMESPACE) {
                continue;
            }
            if let Some(value) = get(&c_path, raw)? {
                attrs.insert(name, value);
            }
        }
        Ok(attrs)
    }

    fn get(c_path: &CString, name: &[u8]) -> Result<Option<Vec<u8>>> {
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidInput("Attribute name contains a NUL byte".to_string()))?;
        // SAFETY: length query with a null buffer.
        let len = unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if len < 0 {
            return Ok(None);
        }
        let mut value = vec![0u8; len as usize];
        // SAFETY: `value` is valid for `value.len()` bytes.
        let len = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if len < 0 {
            return Ok(None);
        }
        value.truncate(len as usize);
        Ok(Some(value))
    }

    pub fn set(path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let c_path = c_path(path)?;
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidInput("Attribute name contains a NUL byte".to_string()))?;
        // SAFETY: all pointers are valid for the given lengths.
        let rc = unsafe {
            libc::lsetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn has(path: &Path, name: &str) -> bool {
        let (Ok(c_path), Ok(c_name)) = (c_path(path), CString::new(name)) else {
            return false;
        };
        // SAFETY: length query with a null buffer.
        let len = unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        len >= 0
    }

    pub fn remove(path: &Path, name: &str) -> Result<()> {
        let c_path = c_path(path)?;
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidInput("Attribute name contains a NUL byte".to_string()))?;
        // SAFETY: both strings are NUL-terminated.
        let rc = unsafe { libc::lremovexattr(c_path.as_ptr(), c_name.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::ENODATA)) || unsupported(&err) {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) mod xattr {
    use std::collections::BTreeMap;
    use std::path::Path;

    use veilvault_common::Result;

    pub fn list(_path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(BTreeMap::new())
    }

    pub fn set(_path: &Path, _name: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    pub fn has(_path: &Path, _name: &str) -> bool {
        false
    }

    pub fn remove(_path: &Path, _name: &str) -> Result<()> {
        Ok(())
    }
}
