//! Periodic enforcement audit.
//!
//! The watcher is the fast path; this loop is the redundant backstop that
//! catches anything it missed (daemon restarts, inotify exhaustion, a
//! killed unlock process). Every tick re-asserts protection for each
//! registered file that is not inside a live unlock window, resolves
//! sessions whose owner died, and checks that the watcher pipeline is
//! still running.

use crate::enforcement::enforcer::Enforcer;
use hostsguard_core::event_log::EventSeverity;
use hostsguard_core::protected_file::ProtectedFile;
use hostsguard_core::session;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// What one audit pass did; returned for logging and for tests.
#[derive(Debug, Default)]
pub struct AuditOutcome {
    pub reasserted: Vec<String>,
    pub recovered_sessions: Vec<String>,
    pub skipped_active: Vec<String>,
    pub failures: Vec<(String, String)>,
}

/// One synchronous audit pass over all registered files.
pub fn audit_pass(
    enforcer: &Enforcer,
    files: &[ProtectedFile],
    state_dir: &Path,
) -> AuditOutcome {
    let mut outcome = AuditOutcome::default();

    for file in files {
        match session::load_session(state_dir, &file.name) {
            Ok(Some(open_session)) => {
                if open_session.owner_alive() {
                    debug!(name = %file.name, "unlock window open; audit skips this file");
                    outcome.skipped_active.push(file.name.clone());
                    continue;
                }
                // Trusted-caller windows outlive their opener: the hook
                // process exits as soon as the window is open, and the
                // window closes on `enforce`, not here. Recovering it would
                // revert the caller's in-flight write.
                if open_session.caller.is_some() {
                    debug!(name = %file.name, "trusted window open; audit skips this file");
                    outcome.skipped_active.push(file.name.clone());
                    continue;
                }
                // The process that opened the session died mid-unlock.
                // Canonical was never touched, so restoring Enforced is
                // safe; the working copy is preserved so the edits are
                // not lost silently.
                let working_copy = open_session
                    .working_copy
                    .as_ref()
                    .map(|p| p.display().to_string());
                warn!(
                    name = %file.name,
                    session = %open_session.session_id,
                    working_copy = working_copy.as_deref().unwrap_or("none"),
                    "recovering stale unlock session; edits preserved in working copy"
                );
                let _ = enforcer.event_log().append(
                    "SESSION_RECOVERED",
                    EventSeverity::Warn,
                    serde_json::json!({
                        "name": file.name,
                        "session_id": open_session.session_id,
                        "state": open_session.state,
                        "working_copy": working_copy,
                    }),
                );
                if let Err(e) = session::clear_session(state_dir, &file.name) {
                    outcome.failures.push((file.name.clone(), e.to_string()));
                    continue;
                }
                match enforcer.enforce(file) {
                    Ok(_) => outcome.recovered_sessions.push(file.name.clone()),
                    Err(e) => {
                        error!(name = %file.name, error = %e, "re-enforcement after recovery failed");
                        outcome.failures.push((file.name.clone(), e.to_string()));
                    }
                }
            }
            Ok(None) => {
                let was_enforced = enforcer.is_enforced(file);
                match enforcer.enforce(file) {
                    Ok(_) => {
                        if !was_enforced {
                            info!(name = %file.name, "audit re-asserted enforcement");
                            let _ = enforcer.event_log().append(
                                "AUDIT_REENFORCED",
                                EventSeverity::Warn,
                                serde_json::json!({"name": file.name}),
                            );
                            outcome.reasserted.push(file.name.clone());
                        }
                    }
                    Err(e) => {
                        // Logged inside the enforcer; retried next tick.
                        outcome.failures.push((file.name.clone(), e.to_string()));
                    }
                }
            }
            Err(e) => {
                error!(name = %file.name, error = %e, "cannot read session state");
                outcome.failures.push((file.name.clone(), e.to_string()));
            }
        }
    }

    outcome
}

/// Control handle for the audit loop.
pub struct AuditLoopHandle {
    /// Wake the loop early (e.g. right after an unlock closes).
    pub wake: Arc<Notify>,
    pub shutdown_tx: watch::Sender<bool>,
}

/// Spawn the audit loop as a tokio task. `pipeline_alive` is flipped to
/// false when the tamper pipeline task exits; the loop reports it through
/// `watcher_restart` so the daemon can rebuild the watcher stack.
#[allow(clippy::too_many_arguments)]
pub fn spawn_audit_loop(
    enforcer: Arc<Enforcer>,
    files: Arc<Vec<ProtectedFile>>,
    state_dir: PathBuf,
    interval: Duration,
    pipeline_alive: Arc<AtomicBool>,
    watcher_restart: Arc<Notify>,
) -> (tokio::task::JoinHandle<()>, AuditLoopHandle) {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_clone = wake.clone();

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "audit loop started");

        // First pass shortly after boot, then on the configured interval.
        let mut next_delay = Duration::from_secs(5).min(interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(next_delay) => {}
                _ = wake_clone.notified() => {
                    debug!("audit loop woken early");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("audit loop shutting down");
                        return;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            next_delay = interval;

            if !pipeline_alive.load(Ordering::SeqCst) {
                error!("tamper pipeline is no longer running; requesting watcher restart");
                let _ = enforcer.event_log().append(
                    "WATCHER_DIED",
                    EventSeverity::Critical,
                    serde_json::json!({}),
                );
                watcher_restart.notify_one();
            }

            let outcome = audit_pass(&enforcer, &files, &state_dir);
            if !outcome.failures.is_empty() {
                warn!(
                    failures = outcome.failures.len(),
                    "audit pass had failures; retrying next tick"
                );
            }
        }
    });

    (handle, AuditLoopHandle { wake, shutdown_tx })
}
