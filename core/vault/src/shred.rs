//! Multi-pass overwrite before deletion.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use rand::RngCore;
use walkdir::WalkDir;

use veilvault_common::{Error, Result};
use veilvault_security::backup::remove_path;

const BLOCK: usize = 64 * 1024;

fn fill_pass(pass: u32, buf: &mut [u8]) {
    match pass % 3 {
        0 => buf.fill(0x00),
        1 => buf.fill(0xFF),
        _ => rand::thread_rng().fill_bytes(buf),
    }
}

/// Overwrite a file in place `passes` times (zeros, ones, random, repeating)
/// and sync after each pass. Returns the file size.
pub fn overwrite_file(path: &Path, passes: u32) -> Result<u64> {
    let len = fs::metadata(path)?.len();
    make_writable(path)?;
    let mut file = OpenOptions::new().write(true).open(path)?;
    overwrite_open_file(&mut file, len, passes)?;
    Ok(len)
}

/// Overwrite the first `len` bytes of an already open file.
///
/// Works on files that were unlinked or replaced after being opened, which
/// lets callers scrub the previous version of an atomically replaced file.
pub fn overwrite_open_file(file: &mut File, len: u64, passes: u32) -> Result<()> {
    let mut buf = vec![0u8; BLOCK];
    for pass in 0..passes {
        file.seek(SeekFrom::Start(0))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(BLOCK as u64) as usize;
            fill_pass(pass, &mut buf[..n]);
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    Ok(())
}

/// Overwrite every regular file under `path`, then remove it.
/// Returns the number of bytes overwritten.
pub fn shred_tree(path: &Path, passes: u32) -> Result<u64> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(0);
    }
    let mut bytes = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.file_type().is_file() {
            bytes += overwrite_file(entry.path(), passes)?;
        }
    }
    remove_path(path)?;
    Ok(bytes)
}

#[cfg(unix)]
fn make_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o200 == 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, vec![0x41u8; 100_000]).unwrap();

        // Two passes end on the all-ones pattern.
        let len = overwrite_file(&path, 2).unwrap();
        assert_eq!(len, 100_000);
        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), 100_000);
        assert!(data.iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_overwrite_after_replace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record.json");
        fs::write(&path, b"old secret").unwrap();

        let mut old = OpenOptions::new().write(true).open(&path).unwrap();
        let tmp = dir.path().join("record.tmp");
        fs::write(&tmp, b"new").unwrap();
        fs::rename(&tmp, &path).unwrap();

        overwrite_open_file(&mut old, 10, 1).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_shred_tree_removes_everything() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("folder");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a"), b"12345").unwrap();
        fs::write(root.join("sub/b"), b"678").unwrap();

        let bytes = shred_tree(&root, 3).unwrap();
        assert_eq!(bytes, 8);
        assert!(!root.exists());
    }

    #[test]
    fn test_shred_missing_is_noop() {
        let dir = TempDir::new().unwrap();
        assert_eq!(shred_tree(&dir.path().join("none"), 3).unwrap(), 0);
    }
}
