//! Debounced tamper pipeline.
//!
//! Receives raw `FileChange` events from the watcher broadcast channel,
//! filters them down to registered live paths, coalesces bursts over a
//! debounce window (editors and package managers emit several events per
//! logical change), then verifies each surviving change against the
//! canonical snapshot and emits `TamperEvent`s.
//!
//! Two pause mechanisms keep authorized writes from being misclassified:
//! the in-process suppression set (the enforcer's own restores) and the
//! persisted unlock-session file (an operator or trusted caller holding
//! the file open in another process).

use crate::enforcement::enforcer::SuppressionSet;
use crate::integrity::watcher::FileChange;
use chrono::{DateTime, Utc};
use hostsguard_core::protected_file::{hash_file, ProtectedFile};
use hostsguard_core::session::{self, EnforcementState};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TamperKind {
    Modified,
    Deleted,
    AttributeChanged,
    Replaced,
}

/// A verified integrity violation, ready for re-enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TamperEvent {
    pub path: PathBuf,
    pub kind: TamperKind,
    pub timestamp: DateTime<Utc>,
}

pub struct PipelineOptions {
    pub debounce_window: Duration,
    pub flush_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(2),
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// Spawn the debounced pipeline. Returns the task handle and the
/// `TamperEvent` sender the orchestrator subscribes to.
pub fn spawn_tamper_pipeline(
    mut raw_rx: broadcast::Receiver<FileChange>,
    files: Arc<Vec<ProtectedFile>>,
    suppressed: Arc<SuppressionSet>,
    state_dir: PathBuf,
    options: PipelineOptions,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> (tokio::task::JoinHandle<()>, broadcast::Sender<TamperEvent>) {
    let (tamper_tx, _) = broadcast::channel::<TamperEvent>(512);
    let tx = tamper_tx.clone();
    let mut shutdown = shutdown;

    let handle = tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, (FileChange, Instant)> = HashMap::new();

        loop {
            tokio::select! {
                result = raw_rx.recv() => {
                    match result {
                        Ok(change) => {
                            let path = change_path(&change);
                            if file_for_path(&files, &path).is_none() {
                                continue;
                            }
                            // The suppression check happens at arrival, not
                            // at flush: by flush time the enforcer's guard
                            // has long dropped and its own attribute flip
                            // would read as tampering.
                            if suppressed.covers(&path, options.debounce_window) {
                                trace!(path = %path.display(), "suppressed event - guard is writing this path");
                                continue;
                            }
                            // A path already pending keeps its first-seen
                            // timestamp, so a busy writer cannot postpone
                            // the flush past the debounce window.
                            match pending.entry(path) {
                                Entry::Occupied(mut slot) => slot.get_mut().0 = change,
                                Entry::Vacant(slot) => {
                                    slot.insert((change, Instant::now()));
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "tamper pipeline lagged; audit loop will catch up");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("watcher channel closed, pipeline exiting");
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(options.flush_interval) => {
                    // flush pass below
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }

            let now = Instant::now();
            let ready: Vec<(PathBuf, FileChange)> = pending
                .iter()
                .filter(|(_, (_, ts))| now.duration_since(*ts) >= options.debounce_window)
                .map(|(p, (c, _))| (p.clone(), c.clone()))
                .collect();

            for (path, change) in ready {
                pending.remove(&path);

                let Some(file) = file_for_path(&files, &path) else {
                    continue;
                };

                if unlock_in_progress(&state_dir, &file.name) {
                    trace!(name = %file.name, "suppressed event - authorized unlock window open");
                    continue;
                }

                if let Some(event) = verify_change(&change, file) {
                    let _ = tx.send(event);
                }
            }
        }
    });

    (handle, tamper_tx)
}

fn change_path(change: &FileChange) -> PathBuf {
    match change {
        FileChange::Modified(p)
        | FileChange::Created(p)
        | FileChange::Removed(p)
        | FileChange::AttributeChanged(p) => p.clone(),
        FileChange::Renamed { from, .. } => from.clone(),
    }
}

fn file_for_path<'a>(files: &'a [ProtectedFile], path: &Path) -> Option<&'a ProtectedFile> {
    files.iter().find(|f| f.live_path == path)
}

/// Pause check against the persisted session file: any state between
/// `Unlocking` and `ReApplying` means writes to the live file are
/// authorized right now.
fn unlock_in_progress(state_dir: &Path, name: &str) -> bool {
    match session::load_session(state_dir, name) {
        Ok(Some(s)) => matches!(
            s.state,
            EnforcementState::Unlocking
                | EnforcementState::Unlocked
                | EnforcementState::ReApplying
        ),
        _ => false,
    }
}

/// Verify a debounced change against the canonical snapshot. Content that
/// still matches canonical is not a violation, whatever the event said.
fn verify_change(change: &FileChange, file: &ProtectedFile) -> Option<TamperEvent> {
    let kind = match change {
        FileChange::Removed(_) | FileChange::Renamed { .. } => {
            if file.live_path.exists() && file.in_sync() {
                // recreated with correct content before we looked
                return None;
            }
            if file.live_path.exists() {
                TamperKind::Replaced
            } else {
                TamperKind::Deleted
            }
        }
        FileChange::Created(_) => {
            if file.in_sync() {
                return None;
            }
            TamperKind::Replaced
        }
        FileChange::Modified(_) => {
            match (
                hash_file(&file.live_path),
                hash_file(&file.canonical_path),
            ) {
                (Ok(live), Ok(canonical)) if live == canonical => return None,
                (Err(_), _) => TamperKind::Deleted,
                _ => TamperKind::Modified,
            }
        }
        FileChange::AttributeChanged(_) => TamperKind::AttributeChanged,
    };

    Some(TamperEvent {
        path: file.live_path.clone(),
        kind,
        timestamp: Utc::now(),
    })
}
