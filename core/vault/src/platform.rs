//! Platform capability checks and placeholder handling.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::metadata::xattr;
use veilvault_common::Result;
use veilvault_security::backup::remove_path;

/// Marker attribute set on placeholder directories.
pub const PLACEHOLDER_XATTR: &str = "user.veilvault.hidden";

/// What the running process is allowed to do to the filesystem.
pub trait Platform: Send + Sync {
    /// Running with administrative privileges.
    fn is_elevated(&self) -> bool;

    /// Whether `path` may be removed by the current process.
    fn can_remove(&self, path: &Path) -> bool;
}

/// The host platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePlatform;

impl Platform for NativePlatform {
    #[cfg(unix)]
    fn is_elevated(&self) -> bool {
        // SAFETY: geteuid has no preconditions.
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(unix))]
    fn is_elevated(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn can_remove(&self, path: &Path) -> bool {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let Some(parent) = path.parent() else {
            return false;
        };
        let Ok(c_parent) = CString::new(parent.as_os_str().as_bytes()) else {
            return false;
        };
        // SAFETY: `c_parent` is a valid NUL-terminated string.
        unsafe { libc::access(c_parent.as_ptr(), libc::W_OK | libc::X_OK) == 0 }
    }

    #[cfg(not(unix))]
    fn can_remove(&self, path: &Path) -> bool {
        path.parent()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false)
    }
}

/// True if removing `path` needs more privilege than the process has.
pub fn requires_elevated_privileges(platform: &dyn Platform, path: &Path) -> bool {
    !platform.is_elevated() && !platform.can_remove(path)
}

/// Turn `path` into a placeholder: emptied, marked and inaccessible.
pub fn make_placeholder(path: &Path) -> Result<()> {
    for entry in fs::read_dir(path)? {
        remove_path(&entry?.path())?;
    }
    if let Err(e) = xattr::set(path, PLACEHOLDER_XATTR, b"1") {
        debug!(error = %e, "Placeholder marker not set");
    }
    set_dir_mode(path, 0o000)
}

/// Whether `path` is a placeholder left by a previous hide.
pub fn is_placeholder(path: &Path) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    if xattr::has(path, PLACEHOLDER_XATTR) {
        return true;
    }
    placeholder_mode(&meta)
}

/// Make a placeholder writable again so it can be repopulated in place.
pub fn clear_placeholder(path: &Path) -> Result<()> {
    set_dir_mode(path, 0o700)?;
    xattr::remove(path, PLACEHOLDER_XATTR)
}

#[cfg(unix)]
fn placeholder_mode(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777 == 0
}

#[cfg(not(unix))]
fn placeholder_mode(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_native_can_remove_in_tempdir() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("x");
        fs::create_dir(&target).unwrap();
        assert!(NativePlatform.can_remove(&target));
        assert!(!requires_elevated_privileges(&NativePlatform, &target));
    }

    #[test]
    fn test_restricted_requires_elevation() {
        let dir = TempDir::new().unwrap();
        assert!(requires_elevated_privileges(&testing::Restricted, dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_placeholder_cycle() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("secret");
        fs::create_dir_all(target.join("inner")).unwrap();
        fs::write(target.join("inner/a.txt"), b"a").unwrap();

        make_placeholder(&target).unwrap();
        assert!(is_placeholder(&target));

        clear_placeholder(&target).unwrap();
        assert!(!is_placeholder(&target));
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }
}
