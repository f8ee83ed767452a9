//! Bind-mount enforcement.
//!
//! Overlays the live path with a read-only bind mount of the canonical
//! snapshot. Used as the fallback when the filesystem has no immutable
//! attribute, and as the stronger guarantee when requested. The critical
//! property is idempotence: repeated enforcement must never accumulate a
//! stack of mounts, so every fresh mount is preceded by a bounded collapse
//! of whatever layers already cover the path.

use hostsguard_core::errors::{GuardError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Raw mount operations behind a trait so idempotence and collapse
/// behavior are testable without root.
pub trait Mounter: Send + Sync {
    fn bind_mount_ro(&self, source: &Path, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
    /// Number of mounts currently stacked on `target`.
    fn mount_layers(&self, target: &Path) -> usize;
}

pub struct MountEnforcer {
    mounter: Arc<dyn Mounter>,
    max_collapse: usize,
}

impl MountEnforcer {
    pub fn new(mounter: Arc<dyn Mounter>, max_collapse: usize) -> Self {
        Self {
            mounter,
            max_collapse,
        }
    }

    pub fn layers(&self, path: &Path) -> usize {
        self.mounter.mount_layers(path)
    }

    /// Collapse with the configured iteration bound.
    pub fn collapse_all(&self, path: &Path) -> usize {
        self.collapse_mounts(path, self.max_collapse)
    }

    /// Collapse existing layers, then apply exactly one fresh read-only
    /// bind mount of `canonical` over `live`.
    pub fn enforce_via_bind_mount(&self, canonical: &Path, live: &Path) -> Result<()> {
        let removed = self.collapse_mounts(live, self.max_collapse);
        if removed > 0 {
            info!(path = %live.display(), removed, "collapsed stale bind-mount layers");
        }
        let remaining = self.mounter.mount_layers(live);
        if remaining > 0 {
            // A failed mount leaves the file unprotected; never swallow it.
            return Err(GuardError::MountFailure {
                path: live.to_path_buf(),
                reason: format!("{remaining} mount layers survived collapse"),
            });
        }
        self.mounter.bind_mount_ro(canonical, live)?;
        info!(
            canonical = %canonical.display(),
            live = %live.display(),
            "read-only bind mount enforced"
        );
        Ok(())
    }

    /// Unmount repeatedly until the layer count reaches zero or the
    /// iteration bound is hit; returns the number of layers removed.
    /// Returns early on an unmount failure (permission, busy device)
    /// rather than looping forever.
    pub fn collapse_mounts(&self, path: &Path, max_iterations: usize) -> usize {
        let mut removed = 0;
        for _ in 0..max_iterations {
            if self.mounter.mount_layers(path) == 0 {
                break;
            }
            match self.mounter.unmount(path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unmount failed during collapse");
                    break;
                }
            }
        }
        removed
    }
}

pub struct LinuxMounter;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::ffi::CString;

    fn cstring(path: &Path) -> Result<CString> {
        use std::os::unix::ffi::OsStrExt;
        CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            GuardError::Io(std::io::Error::other(format!(
                "path contains NUL: {}",
                path.display()
            )))
        })
    }

    impl Mounter for LinuxMounter {
        fn bind_mount_ro(&self, source: &Path, target: &Path) -> Result<()> {
            let src = cstring(source)?;
            let tgt = cstring(target)?;
            let rc = unsafe {
                libc::mount(
                    src.as_ptr(),
                    tgt.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND,
                    std::ptr::null(),
                )
            };
            if rc != 0 {
                return Err(GuardError::MountFailure {
                    path: target.to_path_buf(),
                    reason: std::io::Error::last_os_error().to_string(),
                });
            }
            // A bind mount ignores MS_RDONLY on the first call; the
            // read-only bit needs a remount.
            let rc = unsafe {
                libc::mount(
                    std::ptr::null(),
                    tgt.as_ptr(),
                    std::ptr::null(),
                    libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY,
                    std::ptr::null(),
                )
            };
            if rc != 0 {
                let reason = std::io::Error::last_os_error().to_string();
                // Roll the writable bind mount back; half-enforcement is
                // worse than none plus an error.
                let _ = self.unmount(target);
                return Err(GuardError::MountFailure {
                    path: target.to_path_buf(),
                    reason: format!("read-only remount failed: {reason}"),
                });
            }
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            let tgt = cstring(target)?;
            let rc = unsafe { libc::umount2(tgt.as_ptr(), 0) };
            if rc != 0 {
                return Err(GuardError::MountFailure {
                    path: target.to_path_buf(),
                    reason: format!("umount: {}", std::io::Error::last_os_error()),
                });
            }
            Ok(())
        }

        fn mount_layers(&self, target: &Path) -> usize {
            match std::fs::read_to_string("/proc/self/mountinfo") {
                Ok(mountinfo) => count_mount_points(&mountinfo, target),
                Err(e) => {
                    warn!(error = %e, "cannot read mountinfo; assuming zero layers");
                    0
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for LinuxMounter {
    fn bind_mount_ro(&self, _source: &Path, target: &Path) -> Result<()> {
        Err(GuardError::MountFailure {
            path: target.to_path_buf(),
            reason: "bind mounts are only supported on linux".into(),
        })
    }

    fn unmount(&self, _target: &Path) -> Result<()> {
        Ok(())
    }

    fn mount_layers(&self, _target: &Path) -> usize {
        0
    }
}

/// Count how many mountinfo lines have `target` as their mount point.
/// Mount points are field 5 (index 4), with spaces, tabs, newlines and
/// backslashes octal-escaped.
pub fn count_mount_points(mountinfo: &str, target: &Path) -> usize {
    let target = target.to_string_lossy();
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .filter(|mount_point| unescape_mount_path(mount_point) == target)
        .count()
}

fn unescape_mount_path(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
24 30 0:22 / /proc rw,nosuid shared:13 - proc proc rw
611 30 8:2 /etc/hosts.guard /etc/hosts ro,relatime shared:1 - ext4 /dev/sda2 rw
612 611 8:2 /etc/hosts.guard /etc/hosts ro,relatime shared:1 - ext4 /dev/sda2 rw
613 30 8:2 /srv/with\\040space /mnt/with\\040space rw - ext4 /dev/sda2 rw
";

    #[test]
    fn counts_stacked_layers() {
        assert_eq!(count_mount_points(SAMPLE, Path::new("/etc/hosts")), 2);
        assert_eq!(count_mount_points(SAMPLE, Path::new("/proc")), 1);
        assert_eq!(count_mount_points(SAMPLE, Path::new("/etc/passwd")), 0);
    }

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(
            count_mount_points(SAMPLE, Path::new("/mnt/with space")),
            1
        );
    }
}
