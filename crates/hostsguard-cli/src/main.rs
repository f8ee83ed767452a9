use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use hostsguard_core::config::GuardConfig;
use hostsguard_core::event_log::EventLog;
use hostsguard_core::paths;
use hostsguard_core::GuardError;
use hostsguard_service::enforcement::ensure_root;
use hostsguard_service::status::GuardStatus;
use hostsguard_service::unlock::UnlockFlow;
use hostsguard_service::GuardRuntime;
use std::path::Path;
use std::process::Command;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "hostsguard")]
#[command(version, about = "Manage hostsguard file protection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply (or re-apply) protection; idempotent. Closes a trusted-caller
    /// window by adopting the live content as the new canonical.
    Enforce {
        /// Registered file name; all files when omitted
        name: Option<String>,
    },

    /// Show enforcement state and diagnostics
    Status {
        /// Registered file name; all files when omitted
        name: Option<String>,
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Open an unlock session: edit in $EDITOR, classify the changes,
    /// then re-apply protection
    Unlock {
        /// Registered file name
        name: String,
        /// Trusted caller id (e.g. a package-manager hook); skips the
        /// editor and leaves the window open until `enforce`
        #[arg(long)]
        caller: Option<String>,
    },

    /// Abort any open unlock session and restore protection
    Relock {
        /// Registered file name
        name: String,
    },

    /// Print recent tamper-log entries
    Log {
        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Enforce { name } => enforce_command(name.as_deref()),
        Commands::Status { name, json } => status_command(name.as_deref(), json).await,
        Commands::Unlock { name, caller } => unlock_command(&name, caller),
        Commands::Relock { name } => relock_command(&name),
        Commands::Log { limit } => log_command(limit),
    }
}

fn load_runtime() -> Result<GuardRuntime> {
    let config = GuardConfig::load_or_default()?;
    GuardRuntime::load(config)
}

fn enforce_command(name: Option<&str>) -> Result<()> {
    ensure_root()?;
    let runtime = load_runtime()?;
    let flow = runtime.unlock_flow();

    let targets: Vec<_> = match name {
        Some(n) => vec![runtime
            .file(n)
            .ok_or_else(|| GuardError::UnknownFile(n.to_string()))?],
        None => runtime.files.iter().collect(),
    };

    for file in targets {
        if flow.finalize_trusted_if_open(file)? {
            println!("{}: trusted window closed, live content adopted", file.name);
        }
        runtime
            .enforcer
            .enforce(file)
            .with_context(|| format!("enforce {}", file.name))?;
        println!("{}: enforced", file.name);
    }
    Ok(())
}

async fn status_command(name: Option<&str>, json: bool) -> Result<()> {
    let status = match fetch_daemon_status().await {
        Ok(s) => s,
        Err(_) => offline_status()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "watcher: {}",
        if status.watcher_alive { "alive" } else { "not running" }
    );
    for file in &status.files {
        let file_name = file["name"].as_str().unwrap_or("?");
        if let Some(wanted) = name {
            if file_name != wanted {
                continue;
            }
        }
        println!(
            "{}: {} (immutable={}, mount_layers={}, in_sync={})",
            file_name,
            file["state"].as_str().unwrap_or("?"),
            file["immutable"],
            file["mount_layers"],
            file["in_sync"],
        );
    }
    Ok(())
}

async fn fetch_daemon_status() -> Result<GuardStatus> {
    let socket_path = paths::status_socket_path()?;
    let mut stream = UnixStream::connect(&socket_path).await?;
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Daemon not running: compute the same diagnostics directly.
fn offline_status() -> Result<GuardStatus> {
    let runtime = load_runtime()?;
    let files = runtime
        .files
        .iter()
        .map(|file| {
            let state = UnlockFlow::current_state(&runtime.state_dir, &file.name);
            let diag = runtime.enforcer.diagnostics(file, state);
            serde_json::to_value(diag).map_err(anyhow::Error::from)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(GuardStatus {
        generated_at: chrono::Utc::now(),
        watcher_alive: false,
        files,
    })
}

fn unlock_command(name: &str, caller: Option<String>) -> Result<()> {
    ensure_root()?;
    let runtime = load_runtime()?;
    let file = runtime
        .file(name)
        .ok_or_else(|| GuardError::UnknownFile(name.to_string()))?;
    let flow = runtime.unlock_flow();

    if let Some(caller) = caller {
        flow.unlock_trusted(file, &caller)?;
        println!(
            "{}: unlocked for trusted caller {caller}; run `hostsguard enforce {}` when done",
            file.name, file.name
        );
        return Ok(());
    }

    let report = flow.unlock_with(file, |working_copy| {
        spawn_editor(working_copy)
    })?;

    match report.classification {
        None => println!("{}: no changes, protection re-applied", file.name),
        Some(class) => {
            for change in &report.changes {
                println!(
                    "  {} : {} -> {} [{}]",
                    change.field,
                    change
                        .old_value
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "(absent)".into()),
                    change
                        .new_value
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "(absent)".into()),
                    change.classification,
                );
            }
            if report.delayed_secs > 0 {
                println!(
                    "{}: {class} changes applied after a {}s delay",
                    file.name, report.delayed_secs
                );
            } else {
                println!("{}: {class} changes applied", file.name);
            }
        }
    }
    Ok(())
}

fn spawn_editor(working_copy: &Path) -> hostsguard_core::Result<()> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = Command::new(&editor)
        .arg(working_copy)
        .status()
        .map_err(GuardError::Io)?;
    if !status.success() {
        return Err(GuardError::Io(std::io::Error::other(format!(
            "editor {editor} exited with {status}"
        ))));
    }
    Ok(())
}

fn relock_command(name: &str) -> Result<()> {
    ensure_root()?;
    let runtime = load_runtime()?;
    let file = runtime
        .file(name)
        .ok_or_else(|| GuardError::UnknownFile(name.to_string()))?;
    runtime.unlock_flow().relock(file)?;
    println!("{}: relocked", file.name);
    Ok(())
}

fn log_command(limit: usize) -> Result<()> {
    let path = paths::tamper_log_path()?;
    if !path.exists() {
        bail!("no tamper log at {}", path.display());
    }
    let log = EventLog::new(&path, u64::MAX)?;
    let entries = log.read_recent(None, Some(limit))?;
    if entries.is_empty() {
        println!("no events recorded");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{} [{:?}] {} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.severity,
            entry.event_type,
            entry.data,
        );
    }
    if !log.verify_chain()? {
        return Err(anyhow!("tamper log hash chain is broken"));
    }
    Ok(())
}
