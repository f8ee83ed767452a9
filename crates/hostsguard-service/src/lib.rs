//! hostsguard service library: enforcement engine, watcher stack, unlock
//! flow and audit loop. The `hostsguardd` binary hosts the long-running
//! daemon; the `hostsguard` CLI links this library for its direct
//! enforce/unlock/relock operations.

pub mod enforcement;
pub mod integrity;
pub mod service_state;
pub mod status;
pub mod unlock;

use crate::enforcement::attr::{AttributeGuard, LinuxAttributeGuard};
use crate::enforcement::enforcer::Enforcer;
use crate::enforcement::mount::{LinuxMounter, MountEnforcer, Mounter};
use anyhow::Result;
use hostsguard_core::config::GuardConfig;
use hostsguard_core::event_log::EventLog;
use hostsguard_core::paths;
use hostsguard_core::protected_file::ProtectedFile;
use std::sync::Arc;

const TAMPER_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Everything the CLI and the daemon share.
pub struct GuardRuntime {
    pub config: GuardConfig,
    pub files: Arc<Vec<ProtectedFile>>,
    pub enforcer: Arc<Enforcer>,
    pub state_dir: std::path::PathBuf,
    pub work_dir: std::path::PathBuf,
}

impl GuardRuntime {
    /// Build with the real OS attribute/mount backends.
    pub fn load(config: GuardConfig) -> Result<Self> {
        Self::with_backends(
            config,
            Arc::new(LinuxAttributeGuard),
            Arc::new(LinuxMounter),
        )
    }

    pub fn with_backends(
        config: GuardConfig,
        attr: Arc<dyn AttributeGuard>,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self> {
        let canonical_dir = paths::canonical_dir()?;
        let state_dir = paths::state_dir()?;
        let work_dir = paths::work_dir()?;
        std::fs::create_dir_all(&canonical_dir)?;
        std::fs::create_dir_all(&state_dir)?;
        std::fs::create_dir_all(&work_dir)?;

        let event_log = Arc::new(EventLog::new(
            paths::tamper_log_path()?,
            TAMPER_LOG_MAX_BYTES,
        )?);
        let mounts = MountEnforcer::new(mounter, config.max_mount_collapse);
        let enforcer = Arc::new(Enforcer::new(attr, mounts, event_log));

        let files: Vec<ProtectedFile> = config
            .files
            .iter()
            .map(|spec| ProtectedFile::new(spec, &canonical_dir))
            .collect();

        Ok(Self {
            config,
            files: Arc::new(files),
            enforcer,
            state_dir,
            work_dir,
        })
    }

    pub fn file(&self, name: &str) -> Option<&ProtectedFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn unlock_flow(&self) -> unlock::UnlockFlow {
        unlock::UnlockFlow::new(
            self.enforcer.clone(),
            self.config.clone(),
            self.state_dir.clone(),
            self.work_dir.clone(),
        )
    }
}
