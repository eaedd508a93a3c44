//! github-sync - Mirror non-GitHub repositories on GitHub
//!
//! github-sync keeps GitHub copies of repositories hosted elsewhere (self-hosted
//! git servers, Salsa, sourcehut, plain `git daemon` hosts) up to date. Each
//! upstream is cloned into a bare mirror cache, refreshed on every run, and its
//! branches and tags are pushed to a GitHub repository that is created on demand.
//!
//! ## Core Features
//!
//! - **Sources**: repositories listed in the YAML configuration or a plain-text list file
//! - **GitHub Integration**: repository creation and metadata updates via the GitHub API
//! - **Incremental Mirroring**: bare caches with `git remote update --prune`, pushes skipped
//!   when nothing changed
//! - **Authentication**: GitHub CLI and token-based authentication support
//! - **Daemon Mode**: periodic runs with PID file management and graceful shutdown
//! - **State Tracking**: per-mirror status and an event log in SQLite
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`sources`]: Mirror discovery from configuration and list files
//! - [`github`]: GitHub API integration and authentication
//! - [`git`]: Bare cache maintenance and pushing
//! - [`sync`]: Parallel mirroring engine
//! - [`state`]: SQLite state and event log
//! - [`daemon`]: Looped mode
//! - [`health`]: Preflight checks

pub mod config;
pub mod daemon;
pub mod git;
pub mod github;
pub mod health;
pub mod sources;
pub mod state;
pub mod sync;

pub use config::Config;
pub use daemon::Daemon;
pub use git::{GitClient, PushReport};
pub use github::GitHubClient;
pub use health::HealthCheck;
pub use sources::{MirrorSpec, MultiSource};
pub use state::StateDb;
pub use sync::{MirrorEngine, MirrorHost, MirrorResult, Provision, SyncSummary};
