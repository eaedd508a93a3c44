//! Daemon Infrastructure - Looped mirroring on a fixed interval
//!
//! Provides the long-running mode of github-sync: PID file management,
//! periodic sync runs, run statistics and graceful shutdown on Ctrl+C or
//! SIGTERM.

use crate::sources::MultiSource;
use crate::sync::{MirrorEngine, SyncSummary};
use crate::Config;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Events older than this are pruned after each run
const EVENT_RETENTION_DAYS: i64 = 30;

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    engine: MirrorEngine,
    sources: MultiSource,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
    stats: DaemonStats,
    started_at: Instant,
}

#[derive(Default)]
struct DaemonStats {
    total_runs: AtomicU64,
    successful_runs: AtomicU64,
    failed_runs: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

/// Daemon statistics and status
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub is_running: bool,
    pub uptime: Duration,
    pub last_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub interval: Duration,
}

impl Daemon {
    pub fn new(config: Arc<Config>, engine: MirrorEngine, sources: MultiSource) -> Self {
        let (shutdown_sender, _) = broadcast::channel(1);

        let pid_file_path = if config.daemon.pid_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.daemon.pid_file))
        };

        Self {
            config,
            engine,
            sources,
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path,
            stats: DaemonStats::default(),
            started_at: Instant::now(),
        }
    }

    /// Run the daemon loop in the foreground until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        let sync_interval = self.config.sync_interval()?;

        info!("Starting github-sync daemon");

        self.write_pid_file().context("Failed to write PID file")?;
        self.is_running.store(true, Ordering::SeqCst);

        let shutdown_receiver = self.shutdown_sender.subscribe();

        let is_running = self.is_running.clone();
        let engine_shutdown = self.engine.shutdown_flag();
        let shutdown_sender = self.shutdown_sender.clone();
        let signal_task = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            is_running.store(false, Ordering::SeqCst);
            engine_shutdown.store(true, Ordering::SeqCst);
            let _ = shutdown_sender.send(());
        });

        let result = self.daemon_loop(shutdown_receiver, sync_interval).await;

        signal_task.abort();
        self.cleanup().context("Failed to cleanup daemon")?;

        result
    }

    /// Handle for requesting shutdown from inside the process
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Get current daemon status
    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            is_running: self.is_running.load(Ordering::SeqCst),
            uptime: self.started_at.elapsed(),
            last_run: self.stats.last_run.lock().ok().and_then(|last| *last),
            total_runs: self.stats.total_runs.load(Ordering::SeqCst),
            successful_runs: self.stats.successful_runs.load(Ordering::SeqCst),
            failed_runs: self.stats.failed_runs.load(Ordering::SeqCst),
            interval: self
                .config
                .sync_interval()
                .unwrap_or(Duration::from_secs(1800)),
        }
    }

    async fn daemon_loop(
        &self,
        mut shutdown_receiver: broadcast::Receiver<()>,
        sync_interval: Duration,
    ) -> Result<()> {
        let mut interval_timer = interval(sync_interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Daemon loop started with interval: {:?}", sync_interval);

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }

                // The first tick completes immediately
                _ = interval_timer.tick() => {
                    if !self.is_running.load(Ordering::SeqCst) {
                        break;
                    }

                    debug!("Starting scheduled sync operation");
                    self.run_once().await;
                }
            }
        }

        info!("Daemon loop exiting");
        Ok(())
    }

    async fn run_once(&self) {
        let sync_start = Instant::now();
        self.stats.total_runs.fetch_add(1, Ordering::SeqCst);

        match self.sources.discover_all().await {
            Ok(specs) => {
                let summary = self.engine.run(specs).await;
                self.log_sync_result(&summary, sync_start.elapsed());

                if summary.has_failures() {
                    self.stats.failed_runs.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.stats.successful_runs.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(e) => {
                self.stats.failed_runs.fetch_add(1, Ordering::SeqCst);
                error!("Failed to discover mirrors: {:#}", e);
            }
        }

        if let Ok(mut last_run) = self.stats.last_run.lock() {
            *last_run = Some(Utc::now());
        }

        if let Some(state) = self.engine.state() {
            if let Ok(db) = state.lock() {
                match db.prune_events(chrono::Duration::days(EVENT_RETENTION_DAYS)) {
                    Ok(0) => {}
                    Ok(count) => debug!("Pruned {} old events", count),
                    Err(e) => warn!("Failed to prune old events: {:#}", e),
                }
            }
        }
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Daemon cleanup completed");
        Ok(())
    }

    fn log_sync_result(&self, summary: &SyncSummary, duration: Duration) {
        let log = format!(
            "Sync run finished in {:.2}s: {} mirrors, {} successful, {} failed, {} skipped",
            duration.as_secs_f64(),
            summary.total,
            summary.successful,
            summary.failed,
            summary.skipped
        );

        if summary.has_failures() {
            warn!("{}", log);
        } else {
            info!("{}", log);
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        debug!("Ctrl+C received");
    }
}

/// Detach from the terminal (Unix platforms)
///
/// Must be called before the tokio runtime is built: forking a process
/// that already runs worker threads leaves the child without them.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let working_directory =
        std::env::current_dir().context("Failed to read current directory")?;

    let mut daemonize = Daemonize::new().working_directory(working_directory);

    if !config.daemon.log_file.is_empty() {
        let log_path = PathBuf::from(&config.daemon.log_file);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }

        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
    }

    daemonize.start().context("Failed to daemonize process")?;

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_config: &Config) -> Result<()> {
    Err(anyhow!("Background mode is only supported on Unix platforms"))
}

fn read_pid(config: &Config) -> Result<Option<(PathBuf, i32)>> {
    if config.daemon.pid_file.is_empty() {
        return Ok(None);
    }

    let pid_file = PathBuf::from(&config.daemon.pid_file);
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

    if pid <= 0 {
        return Err(anyhow!("Invalid PID in PID file: {}", pid));
    }

    Ok(Some((pid_file, pid)))
}

/// Stop a running daemon by sending it SIGTERM; `false` when none was running
#[cfg(unix)]
pub fn stop_daemon(config: &Config) -> Result<bool> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if !is_daemon_running(config)? {
        warn!("Daemon is not running");
        return Ok(false);
    }

    let Some((_, pid)) = read_pid(config)? else {
        return Ok(false);
    };

    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .context("Failed to send SIGTERM to daemon process")?;

    info!("Shutdown signal sent to daemon process {}", pid);
    Ok(true)
}

#[cfg(not(unix))]
pub fn stop_daemon(_config: &Config) -> Result<bool> {
    Err(anyhow!("Stopping the daemon is only supported on Unix platforms"))
}

/// Check if daemon is currently running, removing stale PID files
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    let Some((pid_file, pid)) = read_pid(config)? else {
        return Ok(false);
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid), None) {
            Ok(_) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!("Removing stale PID file {}", pid_file.display());
                let _ = fs::remove_file(&pid_file);
                Ok(false)
            }
            // Exists but belongs to someone else
            Err(_) => Ok(true),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid_file, pid);
        Ok(true)
    }
}
