//! The unlock flow: `Enforced -> Unlocking -> Unlocked -> ReApplying ->
//! Enforced`.
//!
//! Protection is suspended, the operator edits a working copy (never the
//! canonical snapshot), the diff is classified against the policy table,
//! and enforcement is re-applied. The one unacceptable outcome is leaving
//! the file unprotected: every exit path after `Unlocking`, success,
//! failure or abort, runs back through `Enforcer::enforce` before this
//! module returns.

use crate::enforcement::enforcer::Enforcer;
use hostsguard_core::config::GuardConfig;
use hostsguard_core::errors::{GuardError, Result};
use hostsguard_core::event_log::EventSeverity;
use hostsguard_core::policy::{ChangeRequest, Classification};
use hostsguard_core::protected_file::{write_atomic, ProtectedFile};
use hostsguard_core::schema;
use hostsguard_core::session::{
    self, EnforcementState, UnlockSession,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What an unlock session did, for the CLI to report.
#[derive(Debug)]
pub struct UnlockReport {
    pub classification: Option<Classification>,
    pub changes: Vec<ChangeRequest>,
    pub delayed_secs: u64,
}

pub struct UnlockFlow {
    enforcer: Arc<Enforcer>,
    config: GuardConfig,
    state_dir: PathBuf,
    work_dir: PathBuf,
}

impl UnlockFlow {
    pub fn new(
        enforcer: Arc<Enforcer>,
        config: GuardConfig,
        state_dir: PathBuf,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            enforcer,
            config,
            state_dir,
            work_dir,
        }
    }

    /// Current state of a file's state machine; `Enforced` is the absence
    /// of a session file.
    pub fn current_state(state_dir: &Path, name: &str) -> EnforcementState {
        match session::load_session(state_dir, name) {
            Ok(Some(s)) => s.state,
            _ => EnforcementState::Enforced,
        }
    }

    /// Run a full unlock session, with `edit` producing the new content in
    /// the working copy (the CLI passes an editor spawn; tests write
    /// directly). Protection is restored before returning, on every path.
    pub fn unlock_with<F>(&self, file: &ProtectedFile, edit: F) -> Result<UnlockReport>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        self.check_existing_session(file)?;

        let mut open_session = UnlockSession::open(&file.name, None);
        session::save_session(&self.state_dir, &open_session)?;

        let result = self.run_unlocked(file, &mut open_session, edit);

        // Restore Enforced before surfacing anything; an unlock that failed
        // is recoverable, an unprotected hosts file is not.
        let restore = self.enforcer.enforce(file);
        session::clear_session(&self.state_dir, &file.name)?;

        match (result, restore) {
            (Ok(report), Ok(_)) => Ok(report),
            (Ok(_), Err(restore_err)) => Err(restore_err),
            (Err(e), _) => Err(e),
        }
    }

    /// Open a non-interactive unlock window for an explicitly trusted
    /// caller (the package-manager hook). The window stays open until
    /// `finalize_trusted_if_open` runs as part of `enforce`.
    pub fn unlock_trusted(&self, file: &ProtectedFile, caller: &str) -> Result<()> {
        if !self.config.trusted_callers.iter().any(|c| c == caller) {
            return Err(GuardError::UntrustedCaller(caller.to_string()));
        }
        self.check_existing_session(file)?;

        let mut open_session = UnlockSession::open(&file.name, Some(caller.to_string()));
        open_session.state = EnforcementState::Unlocked;
        session::save_session(&self.state_dir, &open_session)?;

        if let Err(e) = self.enforcer.clear_protection(file) {
            let _ = self.enforcer.enforce(file);
            session::clear_session(&self.state_dir, &file.name)?;
            return Err(e);
        }

        info!(name = %file.name, caller, "trusted unlock window opened");
        let _ = self.enforcer.event_log().append(
            "TRUSTED_UNLOCK",
            EventSeverity::Info,
            serde_json::json!({"name": file.name, "caller": caller}),
        );
        Ok(())
    }

    /// If a trusted-caller window is open, adopt the live content as the
    /// new canonical snapshot and close the window. Returns whether a
    /// window was closed. Called from `enforce`.
    pub fn finalize_trusted_if_open(&self, file: &ProtectedFile) -> Result<bool> {
        let Some(open_session) = session::load_session(&self.state_dir, &file.name)? else {
            return Ok(false);
        };
        let Some(caller) = open_session.caller.clone() else {
            return Ok(false);
        };
        file.adopt_live_as_canonical()?;
        session::clear_session(&self.state_dir, &file.name)?;
        info!(name = %file.name, caller, "trusted window closed; live content adopted as canonical");
        let _ = self.enforcer.event_log().append(
            "TRUSTED_RELOCK",
            EventSeverity::Info,
            serde_json::json!({"name": file.name, "caller": caller}),
        );
        Ok(true)
    }

    /// Abort any open session and restore `Enforced`. The working copy, if
    /// any, is left on disk.
    pub fn relock(&self, file: &ProtectedFile) -> Result<()> {
        if let Some(open_session) = session::load_session(&self.state_dir, &file.name)? {
            warn!(
                name = %file.name,
                session = %open_session.session_id,
                "aborting unlock session"
            );
            let _ = self.enforcer.event_log().append(
                "UNLOCK_ABORTED",
                EventSeverity::Warn,
                serde_json::json!({
                    "name": file.name,
                    "session_id": open_session.session_id,
                    "working_copy": open_session.working_copy,
                }),
            );
        }
        session::clear_session(&self.state_dir, &file.name)?;
        self.enforcer.enforce(file)?;
        Ok(())
    }

    // ── internals ───────────────────────────────────────────────────────

    fn check_existing_session(&self, file: &ProtectedFile) -> Result<()> {
        let Some(existing) = session::load_session(&self.state_dir, &file.name)? else {
            return Ok(());
        };
        // A pending lenient delay survives its owner: re-running unlock
        // must not reset or bypass the countdown.
        if let Some(remaining_secs) = existing.delay_remaining_secs() {
            return Err(GuardError::DelayPending { remaining_secs });
        }
        // Trusted windows stay open after their opener exits; only
        // `enforce` closes them. Everything else with a live owner is a
        // concurrent session.
        if existing.owner_alive() || existing.caller.is_some() {
            return Err(GuardError::SessionOpen {
                name: file.name.clone(),
                session_id: existing.session_id.to_string(),
                pid: existing.pid,
            });
        }
        // Stale session from a crashed process: restore and continue.
        warn!(
            name = %file.name,
            session = %existing.session_id,
            "clearing stale unlock session before opening a new one"
        );
        session::clear_session(&self.state_dir, &file.name)?;
        self.enforcer.enforce(file)?;
        Ok(())
    }

    fn run_unlocked<F>(
        &self,
        file: &ProtectedFile,
        open_session: &mut UnlockSession,
        edit: F,
    ) -> Result<UnlockReport>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        self.enforcer.clear_protection(file)?;

        // Edits go to a working copy; a crash during edit cannot touch the
        // canonical snapshot.
        let canonical_content = file.read_canonical()?;
        std::fs::create_dir_all(&self.work_dir)?;
        let working_copy = self.work_dir.join(format!(
            "{}-{}.edit",
            file.name,
            &open_session.session_id.simple().to_string()[..8]
        ));
        write_atomic(&working_copy, &canonical_content)?;

        open_session.state = EnforcementState::Unlocked;
        open_session.working_copy = Some(working_copy.clone());
        session::save_session(&self.state_dir, open_session)?;

        edit(&working_copy)?;

        let new_content = std::fs::read(&working_copy)?;
        let old_fields = schema::parse_fields(file.format, &String::from_utf8_lossy(&canonical_content));
        let new_fields = schema::parse_fields(file.format, &String::from_utf8_lossy(&new_content));
        let diff = schema::diff_fields(&old_fields, &new_fields);

        if diff.is_empty() {
            let _ = std::fs::remove_file(&working_copy);
            return Ok(UnlockReport {
                classification: None,
                changes: vec![],
                delayed_secs: 0,
            });
        }

        let (changes, verdict) = self.config.policy.classify_all(diff);
        let verdict = verdict.unwrap_or(Classification::Stricter);

        if verdict == Classification::Forbidden {
            let offending = changes
                .iter()
                .find(|c| c.classification == Classification::Forbidden)
                .cloned();
            let _ = self.enforcer.event_log().append(
                "UNLOCK_REJECTED",
                EventSeverity::Warn,
                serde_json::json!({
                    "name": file.name,
                    "session_id": open_session.session_id,
                    "changes": changes,
                    "working_copy": open_session.working_copy,
                }),
            );
            // Whole session aborts; canonical stays untouched, no partial
            // application of the stricter changes bundled in the same diff.
            let (field, old, new) = offending
                .map(|c| {
                    (
                        c.field,
                        c.old_value.map(|v| v.to_string()).unwrap_or_default(),
                        c.new_value.map(|v| v.to_string()).unwrap_or_default(),
                    )
                })
                .unwrap_or_default();
            return Err(GuardError::ForbiddenChange { field, old, new });
        }

        let mut delayed_secs = 0;
        if verdict == Classification::Lenient {
            delayed_secs = self.config.lenient_delay_secs;
            open_session.state = EnforcementState::ReApplying;
            open_session.not_before =
                Some(Utc::now() + chrono::Duration::seconds(delayed_secs as i64));
            session::save_session(&self.state_dir, open_session)?;

            info!(
                name = %file.name,
                delay_secs = delayed_secs,
                "lenient change; waiting out the reconsideration delay"
            );
            let _ = self.enforcer.event_log().append(
                "UNLOCK_DELAY_STARTED",
                EventSeverity::Info,
                serde_json::json!({
                    "name": file.name,
                    "session_id": open_session.session_id,
                    "delay_secs": delayed_secs,
                }),
            );
            self.wait_out_delay(open_session);
        } else {
            open_session.state = EnforcementState::ReApplying;
            session::save_session(&self.state_dir, open_session)?;
        }

        // Apply: canonical first, then live, both staged+renamed. The
        // suppression guard covers our own live write for an in-process
        // pipeline; the session file covers out-of-process daemons.
        let _suppress = self.enforcer.suppress(&file.live_path);
        file.write_canonical(&new_content)?;
        file.sync_live_from_canonical()?;

        let _ = self.enforcer.event_log().append(
            "UNLOCK_APPLIED",
            EventSeverity::Info,
            serde_json::json!({
                "name": file.name,
                "session_id": open_session.session_id,
                "classification": verdict,
                "changes": changes,
                "delayed_secs": delayed_secs,
            }),
        );
        let _ = std::fs::remove_file(&working_copy);

        Ok(UnlockReport {
            classification: Some(verdict),
            changes,
            delayed_secs,
        })
    }

    /// Block until the persisted deadline passes. The deadline lives in the
    /// session file, not in this process, so being killed here leaves the
    /// canonical untouched and the countdown intact.
    fn wait_out_delay(&self, open_session: &UnlockSession) {
        while let Some(remaining) = open_session.delay_remaining_secs() {
            std::thread::sleep(Duration::from_secs(remaining.min(1)));
        }
    }
}
