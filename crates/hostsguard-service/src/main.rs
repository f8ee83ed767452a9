use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostsguard_core::config::GuardConfig;
use hostsguard_core::event_log::EventSeverity;
use hostsguard_core::paths;
use hostsguard_core::protected_file::cleanup_staging;
use hostsguard_service::enforcement::ensure_root;
use hostsguard_service::integrity::audit_loop::{audit_pass, spawn_audit_loop};
use hostsguard_service::integrity::pipeline::{spawn_tamper_pipeline, PipelineOptions, TamperEvent};
use hostsguard_service::integrity::watcher::FileWatcher;
use hostsguard_service::service_state::ServiceState;
use hostsguard_service::status::spawn_status_server;
use hostsguard_service::GuardRuntime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "hostsguard enforcement daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default configuration, snapshot canonical copies of the
    /// registered files, and apply initial enforcement.
    Init,
    /// Run the watcher and audit loop for all registered files.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init => init_command(),
        Commands::Run => run_command().await,
    }
}

fn init_command() -> Result<()> {
    ensure_root()?;

    let config_path = paths::config_path()?;
    if !config_path.exists() {
        GuardConfig::default().save(&config_path)?;
        info!(path = %config_path.display(), "default configuration written");
    }
    let config = GuardConfig::load_or_default()?;
    let runtime = GuardRuntime::load(config)?;

    for file in runtime.files.iter() {
        if !file.live_path.exists() {
            warn!(
                name = %file.name,
                path = %file.live_path.display(),
                "live file does not exist; skipping"
            );
            continue;
        }
        file.snapshot_from_live()
            .with_context(|| format!("snapshot {}", file.name))?;
        runtime
            .enforcer
            .enforce(file)
            .with_context(|| format!("enforce {}", file.name))?;
        println!("{}: enforced ({})", file.name, file.live_path.display());
    }
    Ok(())
}

async fn run_command() -> Result<()> {
    ensure_root()?;

    let config = GuardConfig::load_or_default()?;
    let runtime = GuardRuntime::load(config)?;

    // A crash during a staged write leaves an orphan next to the target.
    let live_paths: Vec<_> = runtime.files.iter().map(|f| f.live_path.clone()).collect();
    cleanup_staging(&live_paths);

    // Resolve anything left over from before the restart (stale sessions,
    // out-of-sync files) before the watcher comes up.
    let outcome = audit_pass(&runtime.enforcer, &runtime.files, &runtime.state_dir);
    if !outcome.failures.is_empty() {
        warn!(failures = ?outcome.failures, "startup audit had failures");
    }

    let pipeline_alive = Arc::new(AtomicBool::new(true));
    let watcher_restart = Arc::new(Notify::new());

    let state = Arc::new(ServiceState {
        config: runtime.config.clone(),
        files: runtime.files.clone(),
        enforcer: runtime.enforcer.clone(),
        state_dir: runtime.state_dir.clone(),
        pipeline_alive: pipeline_alive.clone(),
    });
    let status_task = spawn_status_server(state)?;

    let (audit_task, audit_handle) = spawn_audit_loop(
        runtime.enforcer.clone(),
        runtime.files.clone(),
        runtime.state_dir.clone(),
        Duration::from_secs(runtime.config.audit_interval_secs),
        pipeline_alive.clone(),
        watcher_restart.clone(),
    );

    info!("daemon started");
    loop {
        pipeline_alive.store(true, Ordering::SeqCst);
        let stack = start_watch_stack(&runtime, pipeline_alive.clone())?;

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("daemon stopping");
                let _ = stack.shutdown_tx.send(true);
                break;
            }
            _ = watcher_restart.notified() => {
                warn!("rebuilding watcher stack");
                let _ = stack.shutdown_tx.send(true);
                stack.consumer.abort();
                // wake the audit loop so a missed tamper window is closed
                audit_handle.wake.notify_one();
            }
        }
    }

    let _ = audit_handle.shutdown_tx.send(true);
    audit_task.abort();
    status_task.abort();
    Ok(())
}

struct WatchStack {
    // Dropping the watcher unregisters the notify subscriptions; keep it
    // alive for the lifetime of the stack.
    _watcher: FileWatcher,
    consumer: tokio::task::JoinHandle<()>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

fn start_watch_stack(
    runtime: &GuardRuntime,
    pipeline_alive: Arc<AtomicBool>,
) -> Result<WatchStack> {
    let (mut watcher, raw_rx) = FileWatcher::new()?;
    for file in runtime.files.iter() {
        watcher.watch_file(&file.live_path)?;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (pipeline_task, tamper_tx) = spawn_tamper_pipeline(
        raw_rx,
        runtime.files.clone(),
        runtime.enforcer.suppressed_paths(),
        runtime.state_dir.clone(),
        PipelineOptions::default(),
        shutdown_rx,
    );

    // Flip the liveness flag when the pipeline exits for any reason; the
    // audit loop turns that into a restart request.
    {
        let alive = pipeline_alive;
        tokio::spawn(async move {
            let _ = pipeline_task.await;
            alive.store(false, Ordering::SeqCst);
        });
    }

    let consumer = spawn_tamper_consumer(runtime, tamper_tx.subscribe());

    Ok(WatchStack {
        _watcher: watcher,
        consumer,
        shutdown_tx,
    })
}

fn spawn_tamper_consumer(
    runtime: &GuardRuntime,
    mut tamper_rx: tokio::sync::broadcast::Receiver<TamperEvent>,
) -> tokio::task::JoinHandle<()> {
    let enforcer = runtime.enforcer.clone();
    let files = runtime.files.clone();

    tokio::spawn(async move {
        loop {
            let event = match tamper_rx.recv().await {
                Ok(e) => e,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "tamper consumer lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            warn!(path = %event.path.display(), kind = ?event.kind, "tampering detected");
            let _ = enforcer.event_log().append(
                "TAMPER_DETECTED",
                EventSeverity::Error,
                serde_json::json!({
                    "path": event.path.display().to_string(),
                    "kind": event.kind,
                    "timestamp": event.timestamp,
                }),
            );

            let Some(file) = files.iter().find(|f| f.live_path == event.path).cloned()
            else {
                continue;
            };
            let enforcer = enforcer.clone();
            // Enforcement is file I/O plus syscalls; keep it off the
            // event-handling task so bursts are not dropped.
            let result =
                tokio::task::spawn_blocking(move || enforcer.enforce(&file)).await;
            match result {
                Ok(Ok(_)) => info!(path = %event.path.display(), "re-enforced after tampering"),
                Ok(Err(e)) => {
                    error!(path = %event.path.display(), error = %e, "re-enforcement failed; audit loop will retry")
                }
                Err(e) => error!(error = %e, "enforcement task panicked"),
            }
        }
    })
}
