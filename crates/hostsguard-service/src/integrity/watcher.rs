//! Real-time file system watcher using the `notify` crate.
//!
//! Watches the parent directory of every protected live file and forwards
//! raw changes through a broadcast channel to the debounced pipeline.
//! Watching the parent rather than the file's inode is what catches
//! delete+recreate, which an inode-level watch would miss.

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Raw file changes the pipeline cares about.
#[derive(Debug, Clone)]
pub enum FileChange {
    Modified(PathBuf),
    Created(PathBuf),
    Removed(PathBuf),
    AttributeChanged(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

pub struct FileWatcher {
    watcher: RecommendedWatcher,
    change_tx: broadcast::Sender<FileChange>,
    watched_dirs: HashSet<PathBuf>,
}

impl FileWatcher {
    pub fn new() -> Result<(Self, broadcast::Receiver<FileChange>)> {
        let (change_tx, change_rx) = broadcast::channel(1024);
        let tx = change_tx.clone();

        let (sync_tx, sync_rx) = mpsc::channel::<std::result::Result<Event, notify::Error>>();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Bridge thread: sync notify events -> async broadcast.
        let tx_clone = tx.clone();
        std::thread::Builder::new()
            .name("hostsguard-watch-bridge".into())
            .spawn(move || loop {
                match sync_rx.recv() {
                    Ok(Ok(event)) => {
                        for change in classify_event(&event) {
                            if tx_clone.send(change).is_err() {
                                debug!("all receivers dropped, stopping watcher bridge");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "file watcher error");
                    }
                    Err(_) => {
                        debug!("watcher channel closed");
                        return;
                    }
                }
            })?;

        Ok((
            Self {
                watcher,
                change_tx: tx,
                watched_dirs: HashSet::new(),
            },
            change_rx,
        ))
    }

    /// Watch the parent directory of a protected live file.
    pub fn watch_file(&mut self, live_path: &PathBuf) -> Result<()> {
        let Some(parent) = live_path.parent() else {
            warn!(path = %live_path.display(), "live path has no parent, cannot watch");
            return Ok(());
        };
        if self.watched_dirs.contains(parent) {
            return Ok(());
        }
        if !parent.exists() {
            warn!(path = %parent.display(), "parent does not exist, cannot watch");
            return Ok(());
        }
        self.watcher.watch(parent, RecursiveMode::NonRecursive)?;
        self.watched_dirs.insert(parent.to_path_buf());
        info!(dir = %parent.display(), file = %live_path.display(), "watching");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileChange> {
        self.change_tx.subscribe()
    }
}

fn classify_event(event: &Event) -> Vec<FileChange> {
    let mut changes = Vec::new();

    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                changes.push(FileChange::Created(path.clone()));
            }
        }
        EventKind::Modify(modify_kind) => {
            use notify::event::ModifyKind;
            match modify_kind {
                ModifyKind::Name(_) if event.paths.len() >= 2 => {
                    changes.push(FileChange::Renamed {
                        from: event.paths[0].clone(),
                        to: event.paths[1].clone(),
                    });
                }
                ModifyKind::Name(_) => {
                    // One-sided rename: treat as removal of the old path.
                    for path in &event.paths {
                        changes.push(FileChange::Removed(path.clone()));
                    }
                }
                ModifyKind::Metadata(_) => {
                    for path in &event.paths {
                        changes.push(FileChange::AttributeChanged(path.clone()));
                    }
                }
                _ => {
                    for path in &event.paths {
                        changes.push(FileChange::Modified(path.clone()));
                    }
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                changes.push(FileChange::Removed(path.clone()));
            }
        }
        _ => {}
    }

    changes
}
