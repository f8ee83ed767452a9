//! Append-only tamper log.
//!
//! JSON-lines file in which every entry carries the hash of its
//! predecessor, so post-hoc truncation or edits break the chain. Rotated
//! by size with a bounded number of rotations kept.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

pub struct EventLog {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

impl EventLog {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        if !path.exists() {
            return Ok((0, CHAIN_START.to_string()));
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: EventEntry = serde_json::from_str(&line)?;
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: EventSeverity,
        data: serde_json::Value,
    ) -> Result<EventEntry> {
        self.rotate_if_needed()?;
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let prev_hash = state.last_hash.clone();
        let mut entry_value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event_type": event_type,
            "severity": severity,
            "data": data,
            "prev_hash": prev_hash,
        });
        let hash = Self::compute_hash(&entry_value);
        entry_value["hash"] = serde_json::Value::String(hash.clone());

        let entry: EventEntry = serde_json::from_value(entry_value)?;
        self.write_entry(&entry)?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn write_entry(&self, entry: &EventEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if let Ok(metadata) = fs::metadata(&self.path) {
            if metadata.len() < self.max_bytes {
                return Ok(());
            }
        } else {
            return Ok(());
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    let next = self.path_with_suffix(i + 1);
                    fs::rename(&rotated, next)?;
                }
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, self.path_with_suffix(1))?;
        }
        // chain restarts in the new file; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Read recent entries, most recent first.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<EventEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: EventEntry = serde_json::from_str(&line)?;
            if let Some(since_ts) = &since {
                if entry.timestamp < *since_ts {
                    continue;
                }
            }
            entries.push(entry);
        }
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Verify the hash chain of the current log file.
    pub fn verify_chain(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(true);
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut expected_prev = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: EventEntry = serde_json::from_str(&line)?;
            if entry.prev_hash != expected_prev {
                return Ok(false);
            }
            let recomputed = Self::compute_hash(&serde_json::json!({
                "seq": entry.seq,
                "timestamp": entry.timestamp,
                "event_type": entry.event_type,
                "severity": entry.severity,
                "data": entry.data,
                "prev_hash": entry.prev_hash,
            }));
            if recomputed != entry.hash {
                return Ok(false);
            }
            expected_prev = entry.hash;
        }
        Ok(true)
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let mut p = self.path.clone();
        let filename = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "tamper.log".to_string());
        p.set_file_name(format!("{}.{}", filename, index));
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_and_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tamper.log");
        let log = EventLog::new(path.clone(), 512).unwrap();
        for i in 0..50 {
            let e = log
                .append("TEST", EventSeverity::Info, serde_json::json!({"i": i}))
                .unwrap();
            assert!(!e.hash.is_empty());
            assert_eq!(e.seq as usize, i + 1);
        }
        let rotated = path.with_file_name("tamper.log.1");
        assert!(rotated.exists());
    }

    #[test]
    fn verify_chain_detects_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tamper.log");
        let log = EventLog::new(path.clone(), 1024 * 1024).unwrap();
        for i in 0..5 {
            log.append("TEST", EventSeverity::Info, serde_json::json!({"i": i}))
                .unwrap();
        }
        assert!(log.verify_chain().unwrap());

        // flip one byte in the middle of the file
        let mut data = fs::read_to_string(&path).unwrap();
        data = data.replacen("\"i\":2", "\"i\":7", 1);
        fs::write(&path, data).unwrap();
        assert!(!log.verify_chain().unwrap());
    }

    #[test]
    fn read_recent_respects_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tamper.log");
        let log = EventLog::new(path, 1024 * 1024).unwrap();
        for i in 0..10 {
            log.append("TEST", EventSeverity::Info, serde_json::json!({"i": i}))
                .unwrap();
        }
        let recent = log.read_recent(None, Some(3)).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].seq, 10);
    }
}
