use crate::enforcement::enforcer::Enforcer;
use hostsguard_core::config::GuardConfig;
use hostsguard_core::protected_file::ProtectedFile;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Shared daemon state handed to the status server and the audit loop.
pub struct ServiceState {
    pub config: GuardConfig,
    pub files: Arc<Vec<ProtectedFile>>,
    pub enforcer: Arc<Enforcer>,
    pub state_dir: PathBuf,
    /// Flipped to false when the tamper pipeline task exits.
    pub pipeline_alive: Arc<AtomicBool>,
}
