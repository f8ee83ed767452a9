//! Process-wide guard configuration.
//!
//! Loaded once at startup and passed into each component; nothing re-reads
//! the file ad hoc. The policy direction table lives here so the per-field
//! Stricter/Lenient/Forbidden directions are explicit, reviewable
//! configuration rather than code.

use crate::errors::Result;
use crate::paths;
use crate::policy::{Direction, FieldRule, PolicyTable, RuleKind};
use crate::schema::{FileFormat, BLOCKED_DOMAINS_FIELD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredFile {
    /// Short name used on the CLI (`hostsguard unlock hosts`).
    pub name: String,
    pub live_path: PathBuf,
    pub format: FileFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    pub files: Vec<RegisteredFile>,
    pub policy: PolicyTable,
    /// Mandatory reconsideration delay for lenient changes, in seconds.
    pub lenient_delay_secs: u64,
    /// Audit loop tick interval, in seconds.
    pub audit_interval_secs: u64,
    /// Bounded unmount iterations when collapsing stacked bind mounts.
    pub max_mount_collapse: usize,
    /// Callers allowed to open a non-interactive unlock window
    /// (the package-manager hook contract). Must be explicit.
    #[serde(default)]
    pub trusted_callers: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            files: vec![
                RegisteredFile {
                    name: "hosts".into(),
                    live_path: PathBuf::from("/etc/hosts"),
                    format: FileFormat::Hosts,
                },
                RegisteredFile {
                    name: "shutdown-schedule".into(),
                    live_path: PathBuf::from("/etc/shutdown-schedule.conf"),
                    format: FileFormat::KeyValue,
                },
            ],
            policy: PolicyTable {
                rules: vec![
                    FieldRule {
                        field: BLOCKED_DOMAINS_FIELD.into(),
                        rule: RuleKind::Set,
                    },
                    FieldRule {
                        field: "SHUTDOWN_HOUR".into(),
                        rule: RuleKind::Numeric {
                            stricter: Direction::Lower,
                            forbidden: None,
                        },
                    },
                    FieldRule {
                        field: "WINDOW_END_HOUR".into(),
                        rule: RuleKind::Numeric {
                            stricter: Direction::Higher,
                            forbidden: Some(Direction::Lower),
                        },
                    },
                ],
            },
            lenient_delay_secs: 60,
            audit_interval_secs: 3600,
            max_mount_collapse: 16,
            trusted_callers: vec!["pacman-hook".into()],
        }
    }
}

impl GuardConfig {
    pub fn file(&self, name: &str) -> Option<&RegisteredFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load the config from the standard location, falling back to defaults
    /// when none has been written yet.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = paths::config_path()?;
        if path.exists() {
            Ok(Self::load(&path)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = GuardConfig::default();
        config.save(&path).unwrap();
        let loaded = GuardConfig::load(&path).unwrap();
        assert_eq!(loaded.files.len(), config.files.len());
        assert_eq!(loaded.lenient_delay_secs, config.lenient_delay_secs);
        assert!(loaded.file("hosts").is_some());
        assert!(loaded.file("nope").is_none());
    }

    #[test]
    fn policy_table_survives_serialization() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        GuardConfig::default().save(&path).unwrap();
        let loaded = GuardConfig::load(&path).unwrap();
        assert!(loaded.policy.rule_for(BLOCKED_DOMAINS_FIELD).is_some());
        assert!(loaded.policy.rule_for("WINDOW_END_HOUR").is_some());
    }
}
