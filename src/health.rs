//! System health checks for github-sync
//!
//! Preflight checks behind `github-sync doctor`: everything a sync run needs
//! before it touches a single repository.

use crate::config::PushMethod;
use crate::git::redact;
use crate::sources::parse_repository_list;
use crate::{Config, GitHubClient};
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// GitHub authentication status
    pub github_auth: CheckResult,
    /// Cache directory status
    pub cache_dir: CheckResult,
    /// Configured sources and their reachability (warning only)
    pub sources: CheckResult,
    /// SSH keys, only relevant when pushing over SSH (warning only)
    pub ssh: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git(),
            github_auth: Self::check_github_auth(config).await,
            cache_dir: Self::check_cache_dir(config),
            sources: Self::check_sources(config).await,
            ssh: Self::check_ssh(config),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.git.passed && self.github_auth.passed && self.cache_dir.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check git installation
    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Check GitHub authentication
    async fn check_github_auth(config: &Config) -> CheckResult {
        match GitHubClient::new(config).await {
            Ok(client) => CheckResult::ok_with_details(
                "GitHub authentication successful",
                format!("Username: {}", client.username()),
            ),
            Err(e) => CheckResult::error_with_details(
                "GitHub authentication failed",
                format!("{}\nRun: github-sync auth setup", e),
            ),
        }
    }

    /// Check that the cache directory exists (or can be created) and is writable
    fn check_cache_dir(config: &Config) -> CheckResult {
        let path = config.cache_path();

        match ensure_writable(&path) {
            Ok(()) => {
                CheckResult::ok_with_details("Cache directory writable", path.display().to_string())
            }
            Err(e) => CheckResult::error_with_details(
                "Cache directory not writable",
                format!("{}: {:#}", path.display(), e),
            ),
        }
    }

    /// Check that sources are configured and HTTP(S) ones answer
    async fn check_sources(config: &Config) -> CheckResult {
        let urls = match configured_sources(config) {
            Ok(urls) => urls,
            Err(e) => {
                return CheckResult::warning_with_details(
                    "Could not read repository list",
                    format!("{:#}", e),
                )
            }
        };

        if urls.is_empty() {
            return CheckResult::warning_with_details(
                "No repositories configured",
                "Add entries under `repositories` or set `repositories_file`",
            );
        }

        let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                return CheckResult::warning_with_details(
                    "Could not probe sources",
                    e.to_string(),
                )
            }
        };

        let mut unreachable = Vec::new();
        for url in &urls {
            if let Err(e) = probe_source(&client, url).await {
                unreachable.push(redact(&format!("{}: {:#}", url, e), None));
            }
        }

        if unreachable.is_empty() {
            CheckResult::ok_with_details(
                "Sources reachable",
                format!("{} repositories configured", urls.len()),
            )
        } else {
            CheckResult::warning_with_details(
                format!("{} of {} sources unreachable", unreachable.len(), urls.len()),
                unreachable.join("\n"),
            )
        }
    }

    /// Check SSH configuration (warning only)
    fn check_ssh(config: &Config) -> CheckResult {
        if config.github.push_method != PushMethod::Ssh {
            return CheckResult::ok("Pushing over HTTPS with the API token");
        }

        let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");
        if !ssh_dir.exists() {
            return CheckResult::warning_with_details(
                "~/.ssh directory not found",
                "SSH pushes may not work. Run: ssh-keygen -t ed25519",
            );
        }

        let ssh_keys = ["id_rsa", "id_ed25519", "id_ecdsa"];
        let found_keys: Vec<_> = ssh_keys
            .iter()
            .filter(|key| ssh_dir.join(key).exists())
            .copied()
            .collect();

        if found_keys.is_empty() {
            CheckResult::warning_with_details(
                "No SSH keys found",
                "SSH pushes may not work. Add a key to your GitHub account.",
            )
        } else {
            CheckResult::ok_with_details("SSH keys found", found_keys.join(", "))
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Git Installation", &self.git),
            ("GitHub Authentication", &self.github_auth),
            ("Cache Directory", &self.cache_dir),
            ("Sources", &self.sources),
            ("SSH Configuration", &self.ssh),
        ]
    }
}

fn ensure_writable(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).context("Failed to create directory")?;

    let probe = path.join(".github-sync-write-test");
    std::fs::write(&probe, b"ok").context("Failed to write test file")?;
    std::fs::remove_file(&probe).context("Failed to remove test file")?;

    Ok(())
}

/// Source URLs from `repositories` and `repositories_file`
pub fn configured_sources(config: &Config) -> Result<Vec<String>> {
    let mut urls: Vec<String> = config
        .repositories
        .iter()
        .map(|entry| entry.source().to_string())
        .collect();

    if let Some(file) = &config.repositories_file {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read repository list {}", file))?;
        urls.extend(parse_repository_list(&content));
    }

    Ok(urls)
}

/// Ask an HTTP(S) source for its refs advertisement; other URL kinds are
/// checked for local existence or skipped.
pub async fn probe_source(client: &reqwest::Client, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let info_refs = format!(
            "{}/info/refs?service=git-upload-pack",
            url.trim_end_matches('/')
        );

        let response = client
            .get(&info_refs)
            .send()
            .await
            .context("Request failed")?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow!("HTTP {}", status.as_u16()))
        }
    } else if let Some(path) = url.strip_prefix("file://") {
        local_repository_exists(Path::new(path))
    } else if url.starts_with('/') {
        local_repository_exists(Path::new(url))
    } else {
        // ssh and scp-like URLs need credentials; leave them to git
        Ok(())
    }
}

fn local_repository_exists(path: &Path) -> Result<()> {
    if path.join("HEAD").exists() || path.join(".git").exists() {
        Ok(())
    } else {
        Err(anyhow!("Not a git repository"))
    }
}
