use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "hostsguard";
pub const APP_NAME: &str = "hostsguard";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("HOSTSGUARD_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn log_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

/// Canonical snapshots live outside any normal edit path.
pub fn canonical_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("canonical"))
}

/// Per-file unlock session state files.
pub fn state_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("state"))
}

/// Working copies opened for edit during an unlock session.
pub fn work_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("work"))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}

pub fn tamper_log_path() -> anyhow::Result<PathBuf> {
    Ok(log_dir()?.join("tamper.log"))
}

pub fn status_socket_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("HOSTSGUARD_STATUS_SOCKET") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join("hostsguard-status.ipc"))
}
