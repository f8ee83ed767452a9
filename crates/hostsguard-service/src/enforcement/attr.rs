//! The immutable-attribute primitive.
//!
//! On Linux this is the `chattr +i` flag, driven directly through
//! `FS_IOC_GETFLAGS`/`FS_IOC_SETFLAGS`. Filesystems without attribute
//! support (tmpfs, NFS, FAT) surface `UnsupportedFilesystem`, which
//! callers treat as a cue to fall back to bind-mount enforcement rather
//! than as a fatal error.

use hostsguard_core::errors::{GuardError, Result};
use std::path::Path;

/// OS-level immutable attribute operations. A trait so the enforcement
/// state machine can be exercised without CAP_LINUX_IMMUTABLE.
pub trait AttributeGuard: Send + Sync {
    fn set_immutable(&self, path: &Path) -> Result<()>;

    /// Idempotent: clearing an already-mutable file succeeds.
    fn clear_immutable(&self, path: &Path) -> Result<()>;

    /// Best-effort query; any error reads as `false`, so callers treat
    /// "unknown" as "unprotected" and re-enforce.
    fn is_immutable(&self, path: &Path) -> bool;
}

pub struct LinuxAttributeGuard;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use tracing::debug;

    // From <linux/fs.h>; libc does not export the FS_*_FL inode flags.
    const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;

    fn read_flags(file: &File) -> std::io::Result<libc::c_long> {
        let mut flags: libc::c_long = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::FS_IOC_GETFLAGS, &mut flags) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(flags)
    }

    fn write_flags(file: &File, flags: libc::c_long) -> std::io::Result<()> {
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::FS_IOC_SETFLAGS, &flags) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn map_err(path: &Path, err: std::io::Error) -> GuardError {
        match err.raw_os_error() {
            Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => {
                GuardError::UnsupportedFilesystem {
                    path: path.to_path_buf(),
                }
            }
            _ => GuardError::Io(err),
        }
    }

    impl AttributeGuard for LinuxAttributeGuard {
        fn set_immutable(&self, path: &Path) -> Result<()> {
            let file = File::open(path)?;
            let flags = read_flags(&file).map_err(|e| map_err(path, e))?;
            if flags & (FS_IMMUTABLE_FL as libc::c_long) != 0 {
                return Ok(());
            }
            write_flags(&file, flags | FS_IMMUTABLE_FL as libc::c_long)
                .map_err(|e| map_err(path, e))?;
            debug!(path = %path.display(), "immutable attribute set");
            Ok(())
        }

        fn clear_immutable(&self, path: &Path) -> Result<()> {
            if !path.exists() {
                return Ok(());
            }
            let file = File::open(path)?;
            let flags = match read_flags(&file) {
                Ok(f) => f,
                // Nothing to clear on filesystems without attributes.
                Err(e) => {
                    return match map_err(path, e) {
                        GuardError::UnsupportedFilesystem { .. } => Ok(()),
                        other => Err(other),
                    }
                }
            };
            if flags & (FS_IMMUTABLE_FL as libc::c_long) == 0 {
                return Ok(());
            }
            write_flags(&file, flags & !(FS_IMMUTABLE_FL as libc::c_long))
                .map_err(|e| map_err(path, e))?;
            debug!(path = %path.display(), "immutable attribute cleared");
            Ok(())
        }

        fn is_immutable(&self, path: &Path) -> bool {
            let Ok(file) = File::open(path) else {
                return false;
            };
            match read_flags(&file) {
                Ok(flags) => flags & (FS_IMMUTABLE_FL as libc::c_long) != 0,
                Err(_) => false,
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl AttributeGuard for LinuxAttributeGuard {
    fn set_immutable(&self, path: &Path) -> Result<()> {
        Err(GuardError::UnsupportedFilesystem {
            path: path.to_path_buf(),
        })
    }

    fn clear_immutable(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn is_immutable(&self, _path: &Path) -> bool {
        false
    }
}
