//! The enforcement engine.
//!
//! One entry point, `enforce`, drives a protected file back to the
//! `Enforced` state: live content resynced from canonical, immutable
//! attribute set, bind-mount fallback applied when the attribute is
//! unavailable. Serialized per file through a lock map so interleaved
//! clear/set or mount/unmount calls cannot corrupt filesystem state, and
//! every live-path write is registered in the suppression set so the
//! watcher never mistakes our own restore for tampering.

use crate::enforcement::attr::AttributeGuard;
use crate::enforcement::mount::MountEnforcer;
use hostsguard_core::errors::{GuardError, Result};
use hostsguard_core::event_log::{EventLog, EventSeverity};
use hostsguard_core::protected_file::ProtectedFile;
use hostsguard_core::session::EnforcementState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How a file ended up protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Attribute,
    BindMount,
}

/// Point-in-time diagnostics for `status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileDiagnostics {
    pub name: String,
    pub live_path: PathBuf,
    pub state: String,
    pub immutable: bool,
    pub mount_layers: usize,
    pub in_sync: bool,
}

pub struct Enforcer {
    attr: Arc<dyn AttributeGuard>,
    mounts: MountEnforcer,
    event_log: Arc<EventLog>,
    /// Per-file locks; enforcement actions on one file never interleave.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Live paths being written by the guard itself. The watcher pipeline
    /// skips events for these.
    suppressed: Arc<SuppressionSet>,
}

/// Paths the guard is writing right now, plus paths it released recently.
/// Watcher events arrive asynchronously, so a path stays covered for a
/// grace period after its guard drops; the enforcer's own writes and
/// attribute flips would otherwise flush out of the debounce window as
/// tampering.
#[derive(Default)]
pub struct SuppressionSet {
    active: Mutex<HashMap<PathBuf, usize>>,
    released: Mutex<HashMap<PathBuf, Instant>>,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, path: &Path) -> SuppressGuard {
        *self
            .active
            .lock()
            .entry(path.to_path_buf())
            .or_insert(0) += 1;
        SuppressGuard {
            set: self.clone(),
            path: path.to_path_buf(),
        }
    }

    fn release(&self, path: &Path) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                active.remove(path);
                self.released
                    .lock()
                    .insert(path.to_path_buf(), Instant::now());
            }
        }
    }

    /// Whether events for this path are the guard's own doing: a guard is
    /// held now, or was released within `grace`.
    pub fn covers(&self, path: &Path, grace: Duration) -> bool {
        if self.active.lock().contains_key(path) {
            return true;
        }
        let mut released = self.released.lock();
        released.retain(|_, t| t.elapsed() < grace);
        released.contains_key(path)
    }
}

/// Scoped suppression: the path is released on drop, on every exit path.
pub struct SuppressGuard {
    set: Arc<SuppressionSet>,
    path: PathBuf,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        self.set.release(&self.path);
    }
}

impl Enforcer {
    pub fn new(
        attr: Arc<dyn AttributeGuard>,
        mounts: MountEnforcer,
        event_log: Arc<EventLog>,
    ) -> Self {
        Self {
            attr,
            mounts,
            event_log,
            locks: Mutex::new(HashMap::new()),
            suppressed: Arc::new(SuppressionSet::new()),
        }
    }

    pub fn suppressed_paths(&self) -> Arc<SuppressionSet> {
        self.suppressed.clone()
    }

    /// Mark a path as being intentionally written; returns a guard that
    /// lifts the suppression when dropped.
    pub fn suppress(&self, path: &Path) -> SuppressGuard {
        self.suppressed.acquire(path)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Re-assert full protection. Idempotent: an already-enforced file is
    /// left untouched content-wise and never gains extra mount layers.
    pub fn enforce(&self, file: &ProtectedFile) -> Result<Protection> {
        let lock = self.lock_for(&file.name);
        let _guard = lock.lock();
        self.enforce_locked(file)
    }

    fn enforce_locked(&self, file: &ProtectedFile) -> Result<Protection> {
        if !file.canonical_path.exists() {
            self.log_critical(
                file,
                "CANONICAL_MISSING",
                serde_json::json!({"canonical": file.canonical_path.display().to_string()}),
            );
            return Err(GuardError::CanonicalMissing {
                name: file.name.clone(),
                path: file.canonical_path.clone(),
            });
        }

        let _suppress = self.suppress(&file.live_path);

        if !file.in_sync() {
            // Writing requires the file to be mutable and unmounted first.
            self.attr.clear_immutable(&file.live_path)?;
            self.mounts.collapse_all(&file.live_path);
            file.sync_live_from_canonical()?;
            info!(name = %file.name, "live file resynced from canonical");
        }

        match self.attr.set_immutable(&file.live_path) {
            Ok(()) => {
                // Collapse any stale layers left by an earlier mount-based
                // enforcement cycle; the attribute now carries protection.
                self.mounts.collapse_all(&file.live_path);
                Ok(Protection::Attribute)
            }
            Err(GuardError::UnsupportedFilesystem { path }) => {
                warn!(
                    path = %path.display(),
                    "immutable attribute unsupported; falling back to bind mount"
                );
                match self
                    .mounts
                    .enforce_via_bind_mount(&file.canonical_path, &file.live_path)
                {
                    Ok(()) => Ok(Protection::BindMount),
                    Err(e) => {
                        self.log_critical(
                            file,
                            "ENFORCEMENT_FAILED",
                            serde_json::json!({"error": e.to_string()}),
                        );
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.log_critical(
                    file,
                    "ENFORCEMENT_FAILED",
                    serde_json::json!({"error": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    /// Suspend protection for an authorized unlock window: attribute
    /// cleared on both the live file and the canonical snapshot, mount
    /// layers collapsed.
    pub fn clear_protection(&self, file: &ProtectedFile) -> Result<()> {
        let lock = self.lock_for(&file.name);
        let _guard = lock.lock();
        self.mounts.collapse_all(&file.live_path);
        self.attr.clear_immutable(&file.live_path)?;
        self.attr.clear_immutable(&file.canonical_path)?;
        Ok(())
    }

    /// Whether the file currently carries any protection and matches its
    /// canonical snapshot.
    pub fn is_enforced(&self, file: &ProtectedFile) -> bool {
        let protected = self.attr.is_immutable(&file.live_path)
            || self.mounts.layers(&file.live_path) > 0;
        protected && file.in_sync()
    }

    pub fn diagnostics(
        &self,
        file: &ProtectedFile,
        state: EnforcementState,
    ) -> FileDiagnostics {
        FileDiagnostics {
            name: file.name.clone(),
            live_path: file.live_path.clone(),
            state: state.to_string(),
            immutable: self.attr.is_immutable(&file.live_path),
            mount_layers: self.mounts.layers(&file.live_path),
            in_sync: file.in_sync(),
        }
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    fn log_critical(&self, file: &ProtectedFile, event_type: &str, data: serde_json::Value) {
        error!(name = %file.name, event = event_type, "file left unprotected");
        if let Err(e) = self
            .event_log
            .append(event_type, EventSeverity::Critical, data)
        {
            error!(error = %e, "failed to append critical event");
        }
    }
}
