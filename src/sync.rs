//! Mirror Engine - Orchestrates parallel mirroring to GitHub
//!
//! For every mirror the engine makes sure the GitHub repository exists,
//! brings the local bare cache up to date with the source, pushes branches
//! and tags, and records the outcome in the state database.

use crate::config::Config;
use crate::git::{redact, CacheUpdate, GitClient, PushReport};
use crate::sources::MirrorSpec;
use crate::state::{EventType, MirrorStatus, StateDb, SyncEventBuilder};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What `ensure_repository` had to do on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provision {
    Created,
    Existing,
    /// Existing repository whose metadata was patched
    Updated,
}

/// Destination side of a mirror
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MirrorHost: Send + Sync {
    /// Create the destination repository if needed and align its metadata
    async fn ensure_repository(&self, spec: &MirrorSpec) -> Result<Provision>;

    async fn repository_exists(&self, spec: &MirrorSpec) -> Result<bool>;

    /// URL git pushes to, possibly carrying credentials
    fn push_url(&self, spec: &MirrorSpec) -> String;

    /// Credential to scrub from error messages
    fn secret(&self) -> Option<String>;

    fn host_name(&self) -> String;
}

/// Outcome of mirroring one repository
#[derive(Debug, Clone)]
pub enum MirrorResult {
    Pushed {
        name: String,
        report: PushReport,
        created: bool,
        cloned: bool,
    },
    UpToDate {
        name: String,
    },
    Skipped {
        name: String,
        reason: String,
    },
    Failed {
        name: String,
        error: String,
    },
}

impl MirrorResult {
    pub fn name(&self) -> &str {
        match self {
            MirrorResult::Pushed { name, .. }
            | MirrorResult::UpToDate { name }
            | MirrorResult::Skipped { name, .. }
            | MirrorResult::Failed { name, .. } => name,
        }
    }
}

/// Results from a complete sync operation
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
    pub results: Vec<MirrorResult>,
}

impl SyncSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Dry-run view of a single mirror
#[derive(Debug, Clone)]
pub struct MirrorPlan {
    pub spec: MirrorSpec,
    pub cached: bool,
    /// `None` when the host could not be asked
    pub remote_exists: Option<bool>,
}

impl MirrorPlan {
    pub fn action(&self) -> &'static str {
        match (self.remote_exists, self.cached) {
            (Some(false), _) => "create repository, clone and push",
            (_, false) => "clone and push",
            (_, true) => "fetch and push changes",
        }
    }
}

/// The engine that mirrors source repositories onto the host
#[derive(Clone)]
pub struct MirrorEngine {
    config: Arc<Config>,
    host: Arc<dyn MirrorHost>,
    git: GitClient,
    state: Option<Arc<Mutex<StateDb>>>,
    shutdown: Arc<AtomicBool>,
}

impl MirrorEngine {
    pub fn new(config: Arc<Config>, host: Arc<dyn MirrorHost>) -> Self {
        let git = GitClient::new(config.clone());

        Self {
            config,
            host,
            git,
            state: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record results and consult previous outcomes in `db`
    pub fn with_state(mut self, db: StateDb) -> Self {
        self.state = Some(Arc::new(Mutex::new(db)));
        self
    }

    pub fn state(&self) -> Option<&Arc<Mutex<StateDb>>> {
        self.state.as_ref()
    }

    /// Flag that makes mirrors which have not started yet report `Skipped`
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Mirror every spec, at most `mirror.max_parallel` at a time
    pub async fn run(&self, specs: Vec<MirrorSpec>) -> SyncSummary {
        let start_time = Instant::now();
        let max_parallel = self.config.mirror.max_parallel.max(1);
        let operation_timeout = Duration::from_secs(self.config.mirror.timeout);

        info!(
            "Mirroring {} repositories to {} (max {} in parallel)",
            specs.len(),
            self.host.host_name(),
            max_parallel
        );

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut futures = FuturesUnordered::new();

        for spec in specs {
            let semaphore = semaphore.clone();
            let engine = self.clone();

            futures.push(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    let result = MirrorResult::Skipped {
                        name: spec.full_name(),
                        reason: "worker pool closed".to_string(),
                    };
                    return (spec, result);
                };

                if engine.shutdown.load(Ordering::SeqCst) {
                    let result = MirrorResult::Skipped {
                        name: spec.full_name(),
                        reason: "shutdown requested".to_string(),
                    };
                    return (spec, result);
                }

                let result = match timeout(operation_timeout, engine.mirror_one(&spec)).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => MirrorResult::Failed {
                        name: spec.full_name(),
                        error: redact(&format!("{:#}", e), engine.host.secret().as_deref()),
                    },
                    Err(_) => {
                        warn!("Mirroring {} timed out", spec.full_name());
                        MirrorResult::Failed {
                            name: spec.full_name(),
                            error: format!(
                                "Operation timed out after {}s",
                                operation_timeout.as_secs()
                            ),
                        }
                    }
                };

                (spec, result)
            });
        }

        let mut results = Vec::new();

        while let Some((spec, result)) = futures.next().await {
            match &result {
                MirrorResult::Pushed { name, report, .. } => info!("{}: {}", name, report),
                MirrorResult::UpToDate { name } => debug!("{}: up to date", name),
                MirrorResult::Skipped { name, reason } => warn!("{}: skipped ({})", name, reason),
                MirrorResult::Failed { name, error } => error!("{}: {}", name, error),
            }

            if let Err(e) = self.record(&spec, &result) {
                warn!("Failed to record state for {}: {:#}", spec.full_name(), e);
            }

            results.push(result);
        }

        let summary = Self::compile_summary(results, start_time.elapsed());

        info!(
            "Sync completed in {:.2}s: {} successful, {} failed, {} skipped",
            summary.duration.as_secs_f64(),
            summary.successful,
            summary.failed,
            summary.skipped
        );

        summary
    }

    async fn mirror_one(&self, spec: &MirrorSpec) -> Result<MirrorResult> {
        let name = spec.full_name();

        let provision = self
            .host
            .ensure_repository(spec)
            .await
            .with_context(|| format!("Failed to prepare {} on {}", name, self.host.host_name()))?;

        if provision == Provision::Updated {
            debug!("{}: repository metadata updated", name);
        }

        let update = self.git.update_cache(spec).await?;

        let previous_ok = self.last_status(&name) == Some(MirrorStatus::Ok);
        if self.config.mirror.skip_unchanged
            && !update.has_changes()
            && previous_ok
            && provision != Provision::Created
        {
            return Ok(MirrorResult::UpToDate { name });
        }

        let url = self.host.push_url(spec);
        let secret = self.host.secret();
        let report = self
            .git
            .push(&spec.cache_path, &url, secret.as_deref())
            .await?;

        if report.changed() == 0 && provision != Provision::Created {
            return Ok(MirrorResult::UpToDate { name });
        }

        Ok(MirrorResult::Pushed {
            name,
            report,
            created: provision == Provision::Created,
            cloned: update == CacheUpdate::Cloned,
        })
    }

    fn last_status(&self, full_name: &str) -> Option<MirrorStatus> {
        let state = self.state.as_ref()?;
        let db = state.lock().ok()?;

        match db.get_mirror(full_name) {
            Ok(mirror) => mirror.map(|m| m.last_sync_status),
            Err(e) => {
                warn!("Failed to read state for {}: {:#}", full_name, e);
                None
            }
        }
    }

    fn record(&self, spec: &MirrorSpec, result: &MirrorResult) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let db = state
            .lock()
            .map_err(|_| anyhow!("State database lock poisoned"))?;

        let name = result.name();
        let source_url = redact(&spec.source_url, None);
        let source = Some(source_url.as_str());

        match result {
            MirrorResult::Pushed {
                report,
                created,
                cloned,
                ..
            } => {
                if *created {
                    db.record_event(
                        SyncEventBuilder::new(EventType::Created, format!("Created {}", name))
                            .mirror(name),
                    )?;
                }
                if *cloned {
                    db.record_event(
                        SyncEventBuilder::new(
                            EventType::Cloned,
                            format!("Cloned {}", source_url),
                        )
                        .mirror(name),
                    )?;
                }
                db.record_event(
                    SyncEventBuilder::new(EventType::Pushed, format!("Pushed {}", report))
                        .mirror(name)
                        .details_json(&serde_json::json!({
                            "new": report.new,
                            "updated": report.updated,
                            "forced": report.forced,
                            "deleted": report.deleted,
                            "up_to_date": report.up_to_date,
                        })),
                )?;
                let changed = u32::try_from(report.changed()).unwrap_or(u32::MAX);
                db.upsert_mirror(name, source, MirrorStatus::Ok, None, changed)?;
            }
            MirrorResult::UpToDate { .. } => {
                db.record_event(
                    SyncEventBuilder::new(EventType::UpToDate, "No upstream changes").mirror(name),
                )?;
                db.upsert_mirror(name, source, MirrorStatus::Ok, None, 0)?;
            }
            MirrorResult::Skipped { reason, .. } => {
                db.record_event(
                    SyncEventBuilder::new(EventType::Skipped, reason.as_str()).mirror(name),
                )?;
                db.upsert_mirror(name, source, MirrorStatus::Skipped, Some(reason), 0)?;
            }
            MirrorResult::Failed { error, .. } => {
                db.record_event(
                    SyncEventBuilder::new(EventType::SyncError, "Mirror failed")
                        .mirror(name)
                        .details(error.as_str()),
                )?;
                db.upsert_mirror(name, source, MirrorStatus::Error, Some(error), 0)?;
            }
        }

        Ok(())
    }

    /// Compile sync summary from results
    pub fn compile_summary(results: Vec<MirrorResult>, duration: Duration) -> SyncSummary {
        let mut successful = 0;
        let mut failed = 0;
        let mut skipped = 0;

        for result in &results {
            match result {
                MirrorResult::Pushed { .. } | MirrorResult::UpToDate { .. } => successful += 1,
                MirrorResult::Skipped { .. } => skipped += 1,
                MirrorResult::Failed { .. } => failed += 1,
            }
        }

        SyncSummary {
            total: results.len(),
            successful,
            failed,
            skipped,
            duration,
            results,
        }
    }

    /// Preview what a sync would do, without touching the cache or the host
    pub async fn plan(&self, specs: Vec<MirrorSpec>) -> Vec<MirrorPlan> {
        info!("Running dry-run analysis for {} mirrors", specs.len());

        let lookups = specs.into_iter().map(|spec| async move {
            let remote_exists = match self.host.repository_exists(&spec).await {
                Ok(exists) => Some(exists),
                Err(e) => {
                    warn!(
                        "Could not check {}: {}",
                        spec.full_name(),
                        redact(&format!("{:#}", e), self.host.secret().as_deref())
                    );
                    None
                }
            };

            MirrorPlan {
                cached: spec.exists_locally(),
                remote_exists,
                spec,
            }
        });

        futures::future::join_all(lookups).await
    }

    /// Get configuration for external inspection
    pub fn config(&self) -> &Config {
        &self.config
    }
}
