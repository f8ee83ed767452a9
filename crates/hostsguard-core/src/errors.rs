use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the guard subsystems.
///
/// `UnsupportedFilesystem` is the one recoverable enforcement error: the
/// caller is expected to fall back to bind-mount enforcement. Everything
/// else either aborts the current operation or is retried by the audit
/// loop on its next tick.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("filesystem does not support the immutable attribute for {path}")]
    UnsupportedFilesystem { path: PathBuf },

    #[error("bind-mount enforcement failed for {path}: {reason}")]
    MountFailure { path: PathBuf, reason: String },

    #[error("forbidden change to '{field}' ({old} -> {new}); session aborted")]
    ForbiddenChange {
        field: String,
        old: String,
        new: String,
    },

    #[error("a lenient change is already pending; {remaining_secs}s of the delay remain")]
    DelayPending { remaining_secs: u64 },

    #[error("unlock session {session_id} already open for '{name}' (pid {pid})")]
    SessionOpen {
        name: String,
        session_id: String,
        pid: u32,
    },

    #[error("no protected file registered under '{0}'")]
    UnknownFile(String),

    #[error("caller '{0}' is not in the trusted caller list")]
    UntrustedCaller(String),

    #[error("canonical snapshot missing for '{name}' at {path}")]
    CanonicalMissing { name: String, path: PathBuf },

    #[error("this command requires root privileges (euid {euid})")]
    NotPrivileged { euid: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GuardError>;
