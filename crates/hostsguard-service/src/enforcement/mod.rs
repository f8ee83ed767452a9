pub mod attr;
pub mod enforcer;
pub mod mount;

use hostsguard_core::errors::{GuardError, Result};

/// Attribute and mount syscalls need elevated rights; fail fast with a
/// clear permission error instead of half-applying protection.
pub fn ensure_root() -> Result<()> {
    #[cfg(unix)]
    {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            return Err(GuardError::NotPrivileged { euid });
        }
    }
    Ok(())
}
