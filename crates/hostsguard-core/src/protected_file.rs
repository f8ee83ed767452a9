//! The protected-file model: a live path, its canonical snapshot, and the
//! file operations both must go through.
//!
//! Writes use a staging file in the target directory followed by an atomic
//! rename, with fsync on the file and (on unix) its parent directory, so a
//! crash mid-write can never leave a half-synced live file or a corrupt
//! canonical snapshot.

use crate::config::RegisteredFile;
use crate::errors::{GuardError, Result};
use crate::schema::FileFormat;
use blake3::Hasher;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Staging file prefix, used to clean up orphans after a crash.
pub const STAGING_PREFIX: &str = ".hostsguard_stage_";

#[derive(Debug, Clone)]
pub struct ProtectedFile {
    pub name: String,
    pub live_path: PathBuf,
    pub canonical_path: PathBuf,
    pub format: FileFormat,
}

impl ProtectedFile {
    pub fn new(spec: &RegisteredFile, canonical_dir: &Path) -> Self {
        Self {
            name: spec.name.clone(),
            live_path: spec.live_path.clone(),
            canonical_path: canonical_dir.join(format!("{}.canonical", spec.name)),
            format: spec.format,
        }
    }

    pub fn read_canonical(&self) -> Result<Vec<u8>> {
        if !self.canonical_path.exists() {
            return Err(GuardError::CanonicalMissing {
                name: self.name.clone(),
                path: self.canonical_path.clone(),
            });
        }
        Ok(fs::read(&self.canonical_path)?)
    }

    pub fn read_live(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.live_path)?)
    }

    /// Whether live content is bit-for-bit equal to the canonical snapshot.
    /// A missing file on either side counts as out of sync.
    pub fn in_sync(&self) -> bool {
        match (hash_file(&self.live_path), hash_file(&self.canonical_path)) {
            (Ok(live), Ok(canonical)) => live == canonical,
            _ => false,
        }
    }

    pub fn write_canonical(&self, content: &[u8]) -> Result<()> {
        write_atomic(&self.canonical_path, content)
    }

    pub fn sync_live_from_canonical(&self) -> Result<()> {
        let content = self.read_canonical()?;
        write_atomic(&self.live_path, &content)
    }

    /// Install-time snapshot: capture the current live content as canonical.
    /// Refuses to overwrite an existing snapshot.
    pub fn snapshot_from_live(&self) -> Result<()> {
        if self.canonical_path.exists() {
            return Ok(());
        }
        let content = self.read_live()?;
        write_atomic(&self.canonical_path, &content)
    }

    /// Adopt the live content as the new canonical snapshot (trusted-caller
    /// relock path).
    pub fn adopt_live_as_canonical(&self) -> Result<()> {
        let content = self.read_live()?;
        write_atomic(&self.canonical_path, &content)
    }
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Staged atomic write: staging file in the same directory, fsync, rename,
/// fsync parent dir.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| GuardError::Io(std::io::Error::other(format!(
            "no parent directory for {}",
            path.display()
        ))))?;
    fs::create_dir_all(parent)?;

    let staging_name = format!("{}{:08x}", STAGING_PREFIX, rand::random::<u32>());
    let staging_path = parent.join(staging_name);

    {
        let mut file = File::create(&staging_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&staging_path, path) {
        let _ = fs::remove_file(&staging_path);
        return Err(e.into());
    }

    #[cfg(unix)]
    {
        if let Ok(dir) = OpenOptions::new().read(true).open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Remove orphaned staging files next to the given paths. Called on startup.
pub fn cleanup_staging(paths: &[PathBuf]) {
    for path in paths {
        let Some(dir) = path.parent() else { continue };
        let Ok(entries) = fs::read_dir(dir) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
