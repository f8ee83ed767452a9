#![allow(dead_code)]

//! Shared harness: in-memory attribute/mount backends so the enforcement
//! state machine runs unprivileged, plus a tempdir-backed guard setup.

use hostsguard_core::config::{GuardConfig, RegisteredFile};
use hostsguard_core::errors::{GuardError, Result};
use hostsguard_core::event_log::EventLog;
use hostsguard_core::protected_file::ProtectedFile;
use hostsguard_core::schema::FileFormat;
use hostsguard_service::enforcement::attr::AttributeGuard;
use hostsguard_service::enforcement::enforcer::Enforcer;
use hostsguard_service::enforcement::mount::{MountEnforcer, Mounter};
use hostsguard_service::unlock::UnlockFlow;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Tracks the immutable flag per path. With `supported == false` every
/// `set_immutable` reports an attribute-less filesystem, which drives the
/// enforcer into its bind-mount fallback.
pub struct FakeAttr {
    supported: bool,
    flags: Mutex<HashSet<PathBuf>>,
}

impl FakeAttr {
    pub fn new(supported: bool) -> Arc<Self> {
        Arc::new(Self {
            supported,
            flags: Mutex::new(HashSet::new()),
        })
    }
}

impl AttributeGuard for FakeAttr {
    fn set_immutable(&self, path: &Path) -> Result<()> {
        if !self.supported {
            return Err(GuardError::UnsupportedFilesystem {
                path: path.to_path_buf(),
            });
        }
        self.flags.lock().insert(path.to_path_buf());
        Ok(())
    }

    fn clear_immutable(&self, path: &Path) -> Result<()> {
        self.flags.lock().remove(path);
        Ok(())
    }

    fn is_immutable(&self, path: &Path) -> bool {
        self.flags.lock().contains(path)
    }
}

/// Counts bind-mount layers per path. `fail_unmount` simulates a busy
/// device so collapse bounds and failure surfacing can be exercised.
pub struct FakeMounter {
    layers: Mutex<HashMap<PathBuf, usize>>,
    pub fail_unmount: Mutex<bool>,
}

impl FakeMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            layers: Mutex::new(HashMap::new()),
            fail_unmount: Mutex::new(false),
        })
    }

    pub fn stack(&self, target: &Path, count: usize) {
        *self.layers.lock().entry(target.to_path_buf()).or_insert(0) += count;
    }
}

impl Mounter for FakeMounter {
    fn bind_mount_ro(&self, _source: &Path, target: &Path) -> Result<()> {
        *self.layers.lock().entry(target.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if *self.fail_unmount.lock() {
            return Err(GuardError::MountFailure {
                path: target.to_path_buf(),
                reason: "device busy".into(),
            });
        }
        let mut layers = self.layers.lock();
        match layers.get_mut(target) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Ok(())
            }
            _ => Err(GuardError::MountFailure {
                path: target.to_path_buf(),
                reason: "not mounted".into(),
            }),
        }
    }

    fn mount_layers(&self, target: &Path) -> usize {
        self.layers.lock().get(target).copied().unwrap_or(0)
    }
}

pub struct TestGuard {
    pub dir: TempDir,
    pub file: ProtectedFile,
    pub enforcer: Arc<Enforcer>,
    pub attr: Arc<FakeAttr>,
    pub mounter: Arc<FakeMounter>,
    pub config: GuardConfig,
    pub state_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl TestGuard {
    pub fn builder() -> TestGuardBuilder {
        TestGuardBuilder {
            format: FileFormat::Hosts,
            content: b"0.0.0.0 ads.example.com\n0.0.0.0 tracker.example.com\n".to_vec(),
            attr_supported: true,
            lenient_delay_secs: 0,
        }
    }

    pub fn flow(&self) -> UnlockFlow {
        UnlockFlow::new(
            self.enforcer.clone(),
            self.config.clone(),
            self.state_dir.clone(),
            self.work_dir.clone(),
        )
    }

    pub fn live_content(&self) -> Vec<u8> {
        std::fs::read(&self.file.live_path).unwrap()
    }

    pub fn canonical_content(&self) -> Vec<u8> {
        std::fs::read(&self.file.canonical_path).unwrap()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.enforcer
            .event_log()
            .read_recent(None, None)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

pub struct TestGuardBuilder {
    format: FileFormat,
    content: Vec<u8>,
    attr_supported: bool,
    lenient_delay_secs: u64,
}

impl TestGuardBuilder {
    pub fn format(mut self, format: FileFormat) -> Self {
        self.format = format;
        self
    }

    pub fn content(mut self, content: &[u8]) -> Self {
        self.content = content.to_vec();
        self
    }

    pub fn attr_supported(mut self, supported: bool) -> Self {
        self.attr_supported = supported;
        self
    }

    pub fn lenient_delay_secs(mut self, secs: u64) -> Self {
        self.lenient_delay_secs = secs;
        self
    }

    pub fn build(self) -> TestGuard {
        let dir = tempfile::tempdir().unwrap();
        let live_path = dir.path().join("live").join("hosts");
        std::fs::create_dir_all(live_path.parent().unwrap()).unwrap();
        std::fs::write(&live_path, &self.content).unwrap();

        let spec = RegisteredFile {
            name: "hosts".into(),
            live_path: live_path.clone(),
            format: self.format,
        };
        let canonical_dir = dir.path().join("canonical");
        std::fs::create_dir_all(&canonical_dir).unwrap();
        let file = ProtectedFile::new(&spec, &canonical_dir);
        file.snapshot_from_live().unwrap();

        let attr = FakeAttr::new(self.attr_supported);
        let mounter = FakeMounter::new();
        let event_log = Arc::new(
            EventLog::new(dir.path().join("tamper.jsonl"), 10 * 1024 * 1024).unwrap(),
        );
        let enforcer = Arc::new(Enforcer::new(
            attr.clone(),
            MountEnforcer::new(mounter.clone(), 16),
            event_log,
        ));

        let config = GuardConfig {
            files: vec![spec],
            lenient_delay_secs: self.lenient_delay_secs,
            ..GuardConfig::default()
        };

        let state_dir = dir.path().join("state");
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::create_dir_all(&work_dir).unwrap();

        TestGuard {
            dir,
            file,
            enforcer,
            attr,
            mounter,
            config,
            state_dir,
            work_dir,
        }
    }
}
