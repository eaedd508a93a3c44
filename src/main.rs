use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use github_sync::daemon::{self, is_daemon_running, stop_daemon};
use github_sync::git::redact;
use github_sync::github::auth_setup;
use github_sync::health::CheckResult;
use github_sync::state::MirrorStatus;
use github_sync::{
    Config, Daemon, GitHubClient, HealthCheck, MirrorEngine, MirrorResult, MirrorSpec,
    MultiSource, StateDb,
};

#[derive(Parser)]
#[command(name = "github-sync")]
#[command(about = "Mirror non-GitHub repositories on GitHub")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file and check GitHub authentication
    Init {
        /// GitHub user or organization that receives the mirrors
        #[arg(long)]
        owner: Option<String>,

        /// Directory for bare mirror caches
        #[arg(long)]
        cache_dir: Option<String>,

        /// Skip authentication setup
        #[arg(long)]
        skip_auth: bool,
    },

    /// Manage authentication
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// Mirror all configured repositories once
    Sync {
        /// Show what would be done without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Only mirror these repositories (name or owner/name)
        #[arg(long, value_name = "NAME")]
        only: Vec<String>,
    },

    /// List configured mirrors
    List {
        /// Show source, cache and last sync for each mirror
        #[arg(long)]
        details: bool,
    },

    /// Show per-mirror state and recent events
    Status {
        /// Number of recent events to show
        #[arg(long, default_value_t = 10)]
        events: u32,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// System health check and diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Set up authentication
    Setup,

    /// Test current authentication
    Test,

    /// Show authentication status
    Status,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Restart daemon in the background
    Restart,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };
    let config = match &cli.command {
        // `init` may be pointed at a file it is about to create
        Some(Commands::Init { .. }) if !config_path.exists() => {
            let mut config = Config::default();
            config.expand_paths()?;
            config
        }
        _ => load_config(cli.config.as_deref())?,
    };

    // Forking has to happen before the runtime spawns its worker threads
    let detached = match &cli.command {
        Some(Commands::Daemon { daemon_command }) => {
            match prepare_background(daemon_command, &config)? {
                Some(detached) => detached,
                None => return Ok(()),
            }
        }
        _ => false,
    };

    init_logging(cli.verbose, &config, !detached)?;
    info!("Starting github-sync v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run(cli.command, config, config_path))
}

async fn run(command: Option<Commands>, config: Config, config_path: PathBuf) -> Result<()> {
    match command {
        None => cmd_sync(false, Vec::new(), config).await,
        Some(Commands::Init {
            owner,
            cache_dir,
            skip_auth,
        }) => cmd_init(owner, cache_dir, skip_auth, config, &config_path).await,
        Some(Commands::Auth { auth_command }) => cmd_auth(auth_command, &config).await,
        Some(Commands::Sync { dry_run, only }) => cmd_sync(dry_run, only, config).await,
        Some(Commands::List { details }) => cmd_list(details, config).await,
        Some(Commands::Status { events }) => cmd_status(events, &config),
        Some(Commands::Daemon { daemon_command }) => cmd_daemon(daemon_command, config).await,
        Some(Commands::Doctor) => cmd_doctor(&config).await,
    }
}

/// Initialize logging: RUST_LOG wins, then --verbose, then `logging.level`
fn init_logging(verbose: bool, config: &Config, ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let layer = match config.logging.format.as_str() {
        "compact" => fmt::layer().with_ansi(ansi).compact().boxed(),
        _ => fmt::layer().with_ansi(ansi).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Stop/detach as needed for daemon commands. `None` means there is nothing
/// left to do, `Some(true)` that this process is now the background daemon.
fn prepare_background(command: &DaemonCommands, config: &Config) -> Result<Option<bool>> {
    match command {
        DaemonCommands::Start { foreground: false } => {
            if is_daemon_running(config)? {
                println!("⚠️  Daemon is already running!");
                println!("   Use 'github-sync daemon stop' to stop it first");
                return Ok(None);
            }
        }
        DaemonCommands::Restart => {
            if is_daemon_running(config)? {
                println!("🛑 Stopping current daemon...");
                stop_daemon(config)?;
                wait_for_exit(config, Duration::from_secs(30))?;
            }
        }
        _ => return Ok(Some(false)),
    }

    config.sync_interval()?;

    println!("🚀 Starting github-sync daemon in the background");
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);
    println!("   Sync interval: {}", config.daemon.interval);

    daemon::daemonize(config)?;
    Ok(Some(true))
}

fn wait_for_exit(config: &Config, limit: Duration) -> Result<()> {
    let step = Duration::from_millis(250);
    let mut waited = Duration::ZERO;

    while is_daemon_running(config)? {
        if waited >= limit {
            anyhow::bail!("Daemon did not stop within {}s", limit.as_secs());
        }
        std::thread::sleep(step);
        waited += step;
    }

    Ok(())
}

/// Write a configuration file
async fn cmd_init(
    owner: Option<String>,
    cache_dir: Option<String>,
    skip_auth: bool,
    config: Config,
    config_path: &Path,
) -> Result<()> {
    info!("Initializing github-sync...");

    let mut new_config = config;
    if owner.is_some() {
        new_config.github.owner = owner;
    }
    if let Some(cache_dir) = cache_dir {
        new_config.cache_directory = cache_dir;
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    new_config.save(config_path)?;

    new_config.expand_paths()?;
    std::fs::create_dir_all(&new_config.cache_directory).with_context(|| {
        format!(
            "Failed to create cache directory {}",
            new_config.cache_directory
        )
    })?;

    if !skip_auth {
        auth_setup::setup_authentication().await?;
    }

    println!("✅ github-sync initialized successfully!");
    println!("   Config: {}", config_path.display());
    println!("   Cache directory: {}", new_config.cache_directory);
    println!("   Next: add repositories to the config and run 'github-sync sync'");

    Ok(())
}

/// Handle authentication commands
async fn cmd_auth(auth_command: AuthCommands, config: &Config) -> Result<()> {
    match auth_command {
        AuthCommands::Setup => auth_setup::setup_authentication().await,
        AuthCommands::Test => auth_setup::test_authentication(config).await,
        AuthCommands::Status => {
            match GitHubClient::new(config).await {
                Ok(client) => {
                    println!("✅ Authentication successful");
                    println!("   Username: {}", client.username());
                }
                Err(e) => {
                    println!("❌ Authentication failed: {}", e);
                }
            }
            Ok(())
        }
    }
}

fn build_engine(config: Arc<Config>, client: GitHubClient) -> Result<MirrorEngine> {
    let engine = MirrorEngine::new(config.clone(), Arc::new(client));

    if config.state.enabled {
        let db = StateDb::open(&config).context("Failed to open state database")?;
        Ok(engine.with_state(db))
    } else {
        Ok(engine)
    }
}

fn default_owner(config: &Config, client: &GitHubClient) -> String {
    config
        .github
        .owner
        .clone()
        .unwrap_or_else(|| client.username().to_string())
}

/// Keep only the specs named in `--only`
fn filter_only(specs: Vec<MirrorSpec>, only: &[String]) -> Vec<MirrorSpec> {
    if only.is_empty() {
        return specs;
    }

    let matches = |spec: &MirrorSpec, wanted: &str| {
        spec.name.eq_ignore_ascii_case(wanted) || spec.full_name().eq_ignore_ascii_case(wanted)
    };

    for wanted in only {
        if !specs.iter().any(|spec| matches(spec, wanted)) {
            warn!("No configured mirror named {}", wanted);
        }
    }

    specs
        .into_iter()
        .filter(|spec| only.iter().any(|wanted| matches(spec, wanted)))
        .collect()
}

/// Mirror repositories according to configuration
async fn cmd_sync(dry_run: bool, only: Vec<String>, config: Config) -> Result<()> {
    let config = Arc::new(config);
    let client = GitHubClient::new(&config).await?;
    let owner = default_owner(&config, &client);

    println!("🔍 Reading configured repositories...");
    let specs = MultiSource::from_config(config.clone(), owner)
        .discover_all()
        .await?;
    let specs = filter_only(specs, &only);
    println!("   Found {} repositories", specs.len());

    if specs.is_empty() {
        println!("Nothing to mirror. Add repositories to your configuration.");
        return Ok(());
    }

    let engine = build_engine(config, client)?;

    if dry_run {
        println!("\n🔍 Dry run mode - nothing will be changed");

        for plan in engine.plan(specs).await {
            println!(
                "   {} ← {}: {}",
                plan.spec.full_name(),
                redact(&plan.spec.source_url, None),
                plan.action()
            );
        }

        return Ok(());
    }

    println!("\n🔄 Mirroring to GitHub");
    let summary = engine.run(specs).await;

    println!("\n🎉 Mirroring Complete!");
    println!("   📊 Total mirrors: {}", summary.total);
    println!("   ✅ Successful: {}", summary.successful);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏭️  Skipped: {}", summary.skipped);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    for result in &summary.results {
        match result {
            MirrorResult::Pushed { name, report, created, .. } => {
                let marker = if *created { " (created)" } else { "" };
                println!("   ⬆️  {}{}: {}", name, marker, report);
            }
            MirrorResult::Failed { name, error } => println!("   ❌ {}: {}", name, error),
            MirrorResult::Skipped { name, reason } => println!("   ⏭️  {}: {}", name, reason),
            MirrorResult::UpToDate { .. } => {}
        }
    }

    if summary.has_failures() {
        std::process::exit(1);
    }

    Ok(())
}

/// List configured mirrors
async fn cmd_list(details: bool, config: Config) -> Result<()> {
    let config = Arc::new(config);

    let owner = match &config.github.owner {
        Some(owner) => owner.clone(),
        None => GitHubClient::new(&config).await?.username().to_string(),
    };

    let specs = MultiSource::from_config(config.clone(), owner)
        .discover_all()
        .await?;

    let state = if details && config.state.enabled {
        StateDb::open(&config)
            .map_err(|e| warn!("State database unavailable: {:#}", e))
            .ok()
    } else {
        None
    };

    println!("Mirrors ({}):", specs.len());

    for spec in specs {
        if !details {
            println!("  📁 {} ← {}", spec.full_name(), redact(&spec.source_url, None));
            continue;
        }

        println!("📁 {}", spec.full_name());
        println!("   🔗 Source: {}", redact(&spec.source_url, None));
        if let Some(description) = &spec.description {
            println!("   📝 {}", description);
        }
        println!(
            "   💾 Cache: {}{}",
            spec.cache_path.display(),
            if spec.exists_locally() { "" } else { " (not cloned yet)" }
        );
        println!("   🔒 Private: {}", spec.private);

        if let Some(db) = &state {
            if let Some(mirror) = db.get_mirror(&spec.full_name())? {
                let last = mirror
                    .last_sync_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "   🕒 Last sync: {} ({})",
                    last,
                    mirror.last_sync_status.as_str()
                );
            }
        }
        println!();
    }

    Ok(())
}

/// Show per-mirror state and recent events
fn cmd_status(events: u32, config: &Config) -> Result<()> {
    if !config.state.enabled {
        println!("State tracking is disabled (state.enabled: false)");
        return Ok(());
    }

    let db = StateDb::open(config).context("Failed to open state database")?;
    let mirrors = db.list_mirrors(None)?;

    println!("📊 Mirror Status ({} tracked)", mirrors.len());

    for mirror in &mirrors {
        let icon = match mirror.last_sync_status {
            MirrorStatus::Ok => "✅",
            MirrorStatus::Skipped => "⏭️ ",
            MirrorStatus::Error => "❌",
            MirrorStatus::Unknown => "❔",
        };
        let last = mirror
            .last_sync_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());

        println!("  {} {} (last good sync: {})", icon, mirror.full_name, last);
        if let Some(error) = &mirror.last_error {
            println!("     {}", error);
        }
    }

    let (info_count, warning_count, error_count) = db.event_counts()?;
    println!();
    println!(
        "📜 Events: {} info, {} warnings, {} errors",
        info_count, warning_count, error_count
    );

    for event in db.recent_events(events, None)? {
        println!(
            "  {} [{}] {} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.severity.as_str(),
            event.mirror.as_deref().unwrap_or("-"),
            event.summary
        );
    }

    Ok(())
}

/// Build and run the daemon in this process
async fn run_daemon(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let client = GitHubClient::new(&config).await?;
    let owner = default_owner(&config, &client);

    let sources = MultiSource::from_config(config.clone(), owner);
    let engine = build_engine(config.clone(), client)?;

    Daemon::new(config, engine, sources).run().await
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            if foreground {
                if is_daemon_running(&config)? {
                    println!("⚠️  Daemon is already running!");
                    return Ok(());
                }
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            }
            run_daemon(config).await?;
        }

        DaemonCommands::Restart => run_daemon(config).await?,

        DaemonCommands::Stop => {
            println!("🛑 Stopping github-sync daemon...");

            if stop_daemon(&config)? {
                println!("✅ Daemon stop signal sent");
            } else {
                println!("⚠️  No daemon appears to be running");
            }
        }

        DaemonCommands::Status => {
            println!("📊 github-sync Daemon Status");

            if is_daemon_running(&config)? {
                println!("   🟢 Status: Running");
                println!("   🔄 Sync interval: {}", config.daemon.interval);
                println!("   📄 PID file: {}", config.daemon.pid_file);

                if !config.daemon.log_file.is_empty() {
                    println!("   📄 Log file: {}", config.daemon.log_file);
                }

                if config.state.enabled {
                    let db = StateDb::open(&config)?;
                    let mirrors = db.list_mirrors(None)?;
                    let failing = mirrors
                        .iter()
                        .filter(|m| m.last_sync_status == MirrorStatus::Error)
                        .count();
                    if let Some(last) = mirrors.iter().filter_map(|m| m.last_sync_at).max() {
                        println!("   🕒 Last successful mirror: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
                    }
                    println!("   📊 Mirrors: {} tracked, {} failing", mirrors.len(), failing);
                }
            } else {
                println!("   🔴 Status: Not running");
                println!("   💡 Use 'github-sync daemon start' to start the daemon");
            }
        }
    }

    Ok(())
}

/// System health check and diagnostics
async fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);

    if !health.all_passed() {
        std::process::exit(1);
    }

    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning {
                "⚠️ "
            } else {
                "✅"
            }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 github-sync System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
