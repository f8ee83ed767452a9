//! Status transport: Unix domain socket (local-only) serving a JSON
//! snapshot of every protected file's diagnostics. The CLI reads it when
//! the daemon is running and falls back to computing diagnostics offline
//! otherwise.

use crate::service_state::ServiceState;
use crate::unlock::UnlockFlow;
use anyhow::Result;
use chrono::{DateTime, Utc};
use hostsguard_core::paths::status_socket_path;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[cfg(unix)]
use tokio::{io::AsyncWriteExt, net::UnixListener};

use crate::enforcement::enforcer::FileDiagnostics;

#[derive(Debug, Serialize, Deserialize)]
pub struct GuardStatus {
    pub generated_at: DateTime<Utc>,
    pub watcher_alive: bool,
    pub files: Vec<serde_json::Value>,
}

pub fn snapshot(state: &ServiceState) -> GuardStatus {
    let files = state
        .files
        .iter()
        .map(|file| {
            let machine_state = UnlockFlow::current_state(&state.state_dir, &file.name);
            let diag: FileDiagnostics = state.enforcer.diagnostics(file, machine_state);
            serde_json::to_value(diag).unwrap_or_else(|e| {
                serde_json::json!({"name": file.name, "error": e.to_string()})
            })
        })
        .collect();
    GuardStatus {
        generated_at: Utc::now(),
        watcher_alive: state.pipeline_alive.load(Ordering::SeqCst),
        files,
    }
}

#[cfg(unix)]
pub fn spawn_status_server(state: Arc<ServiceState>) -> Result<JoinHandle<()>> {
    let socket_path = status_socket_path()?;
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    use std::os::unix::fs::PermissionsExt;
    let listener = UnixListener::bind(&socket_path)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let payload = serde_json::to_vec(&snapshot(&state));
                    if let Ok(bytes) = payload {
                        let _ = stream.write_all(&bytes).await;
                    }
                    let _ = stream.shutdown().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "status socket accept error");
                    break;
                }
            }
        }
    });

    Ok(task)
}

#[cfg(not(unix))]
pub fn spawn_status_server(_: Arc<ServiceState>) -> Result<JoinHandle<()>> {
    Err(anyhow::anyhow!(
        "status server is only available on unix via UDS transport"
    ))
}
