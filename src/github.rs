use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use octocrab::models::Repository;
use octocrab::Octocrab;
use serde::Serialize;
use std::env;
use std::future::Future;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{parse_duration, Config, PushMethod, RetryConfig};
use crate::sources::MirrorSpec;
use crate::sync::{MirrorHost, Provision};

/// GitHub client wrapper with authentication management
pub struct GitHubClient {
    client: Octocrab,
    username: String,
    token: String,
    push_host: String,
    push_method: PushMethod,
    update_metadata: bool,
    retry: RetryPolicy,
}

/// GitHub authentication strategies
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
}

/// Exponential backoff for rate-limited API calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Ok(Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_secs(
                parse_duration(&config.initial_backoff).context("Invalid retry.initial_backoff")?,
            ),
            max_backoff: Duration::from_secs(
                parse_duration(&config.max_backoff).context("Invalid retry.max_backoff")?,
            ),
        })
    }

    /// Delay before retry number `attempt` (0-based): initial * 2^attempt, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Run `op`, retrying with backoff while `is_retryable` says so
pub async fn with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: P,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} rate limited (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    policy.max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Primary (403) and secondary (429) rate limit responses
pub fn is_rate_limited(error: &octocrab::Error) -> bool {
    match error {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            status == 429
                || (status == 403 && source.message.to_lowercase().contains("rate limit"))
        }
        _ => false,
    }
}

fn is_not_found(error: &octocrab::Error) -> bool {
    matches!(error, octocrab::Error::GitHub { source, .. } if source.status_code.as_u16() == 404)
}

/// Body of `POST /user/repos` and `POST /orgs/{org}/repos`
#[derive(Debug, Serialize)]
struct CreateRepository<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    homepage: Option<&'a str>,
    private: bool,
    has_issues: bool,
    has_wiki: bool,
    has_projects: bool,
}

/// Body of `PATCH /repos/{owner}/{repo}`
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct RepositoryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

/// Metadata fields of an existing repository that differ from the spec
pub fn metadata_patch(
    current_description: Option<&str>,
    current_homepage: Option<&str>,
    spec: &MirrorSpec,
) -> Option<RepositoryPatch> {
    let differs = |current: Option<&str>, wanted: Option<&str>| -> bool {
        match wanted {
            Some(wanted) => current.unwrap_or_default() != wanted,
            None => false,
        }
    };

    let patch = RepositoryPatch {
        description: differs(current_description, spec.description.as_deref())
            .then(|| spec.description.clone())
            .flatten(),
        homepage: differs(current_homepage, spec.homepage.as_deref())
            .then(|| spec.homepage.clone())
            .flatten(),
    };

    (patch != RepositoryPatch::default()).then_some(patch)
}

impl GitHubClient {
    /// Create a new GitHub client with automatic authentication
    pub async fn new(config: &Config) -> Result<Self> {
        let (auth_strategy, token) = Self::detect_authentication(config)?;

        info!("Using authentication strategy: {:?}", auth_strategy);

        let client = build_octocrab(&token, config.github.api_url.as_deref())?;

        let user = client
            .current()
            .user()
            .await
            .context("Failed to get current user information. Check your authentication.")?;

        let username = config
            .github
            .username
            .clone()
            .unwrap_or_else(|| user.login.clone());

        info!("Authenticated as GitHub user: {}", username);

        Self::from_parts(client, username, token, config)
    }

    /// Assemble a client from an existing octocrab instance
    pub fn from_parts(
        client: Octocrab,
        username: impl Into<String>,
        token: impl Into<String>,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            client,
            username: username.into(),
            token: token.into(),
            push_host: config.github.push_host.clone(),
            push_method: config.github.push_method,
            update_metadata: config.github.update_metadata,
            retry: RetryPolicy::from_config(&config.mirror.retry)?,
        })
    }

    /// Detect and obtain GitHub authentication
    fn detect_authentication(config: &Config) -> Result<(AuthStrategy, String)> {
        match config.github.auth_method.as_str() {
            "auto" => {
                // GitHub CLI first, then the environment token
                if let Ok(token) = Self::try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, token))
                } else if let Ok(token) = Self::try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, token))
                } else {
                    Err(anyhow!(
                        "No GitHub authentication found. Please either:\n\
                         1. Install and authenticate GitHub CLI: gh auth login\n\
                         2. Set GITHUB_TOKEN environment variable\n\
                         3. Run: github-sync auth setup"
                    ))
                }
            }
            "gh_cli" => {
                let token = Self::try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, token))
            }
            "token" => {
                let token = Self::try_environment_token()
                    .context("GITHUB_TOKEN environment variable not found or invalid")?;
                Ok((AuthStrategy::EnvironmentToken, token))
            }
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> Result<String> {
        debug!("Attempting GitHub CLI authentication");

        if !is_command_available("gh") {
            return Err(anyhow!("GitHub CLI (gh) is not installed"));
        }

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to get GitHub CLI token")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr).trim()
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> Result<String> {
        debug!("Attempting environment variable authentication");

        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;
        let token = token.trim().to_string();

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !looks_like_github_token(&token) {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected a ghp_, gho_, ghs_ or github_pat_ prefix)");
        }

        Ok(token)
    }

    /// Get the authenticated username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Fetch a repository, `None` when it does not exist
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let label = format!("GET repos/{}/{}", owner, name);
        let result = with_backoff(&self.retry, &label, is_rate_limited, || async move {
            self.client.repos(owner, name).get().await
        })
        .await;

        match result {
            Ok(repo) => Ok(Some(repo)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to look up {}/{}", owner, name)),
        }
    }

    /// Create the destination repository for a mirror
    pub async fn create_repository(&self, spec: &MirrorSpec) -> Result<Repository> {
        let route = if spec.owner.eq_ignore_ascii_case(&self.username) {
            "/user/repos".to_string()
        } else {
            format!("/orgs/{}/repos", spec.owner)
        };

        let body = CreateRepository {
            name: &spec.name,
            description: spec.description.as_deref(),
            homepage: spec.homepage.as_deref(),
            private: spec.private,
            has_issues: false,
            has_wiki: false,
            has_projects: false,
        };

        info!("Creating GitHub repository {}", spec.full_name());

        let route = route.as_str();
        let body = &body;
        let repo: Repository = with_backoff(&self.retry, route, is_rate_limited, || async move {
            self.client.post(route, Some(body)).await
        })
        .await
        .with_context(|| format!("Failed to create repository {}", spec.full_name()))?;

        Ok(repo)
    }

    /// Apply a metadata patch to an existing repository
    pub async fn update_repository(&self, spec: &MirrorSpec, patch: &RepositoryPatch) -> Result<()> {
        let route = format!("/repos/{}/{}", spec.owner, spec.name);
        let route = route.as_str();

        info!("Updating metadata of {}", spec.full_name());

        let _repo: Repository = with_backoff(&self.retry, route, is_rate_limited, || async move {
            self.client.patch(route, Some(patch)).await
        })
        .await
        .with_context(|| format!("Failed to update repository {}", spec.full_name()))?;

        Ok(())
    }

    /// List organizations the user is a member of
    pub async fn list_user_organizations(&self) -> Result<Vec<String>> {
        let orgs = self
            .client
            .current()
            .list_org_memberships_for_authenticated_user()
            .per_page(100)
            .send()
            .await
            .context("Failed to fetch user organizations")?;

        Ok(orgs
            .items
            .into_iter()
            .map(|membership| membership.organization.login)
            .collect())
    }
}

#[async_trait]
impl MirrorHost for GitHubClient {
    async fn ensure_repository(&self, spec: &MirrorSpec) -> Result<Provision> {
        let Some(repo) = self.get_repository(&spec.owner, &spec.name).await? else {
            self.create_repository(spec).await?;
            return Ok(Provision::Created);
        };

        if !self.update_metadata {
            return Ok(Provision::Existing);
        }

        match metadata_patch(repo.description.as_deref(), repo.homepage.as_deref(), spec) {
            Some(patch) => {
                self.update_repository(spec, &patch).await?;
                Ok(Provision::Updated)
            }
            None => Ok(Provision::Existing),
        }
    }

    async fn repository_exists(&self, spec: &MirrorSpec) -> Result<bool> {
        Ok(self.get_repository(&spec.owner, &spec.name).await?.is_some())
    }

    fn push_url(&self, spec: &MirrorSpec) -> String {
        match self.push_method {
            PushMethod::Https => format!(
                "https://x-access-token:{}@{}/{}/{}.git",
                self.token, self.push_host, spec.owner, spec.name
            ),
            PushMethod::Ssh => format!("git@{}:{}/{}.git", self.push_host, spec.owner, spec.name),
        }
    }

    fn secret(&self) -> Option<String> {
        Some(self.token.clone())
    }

    fn host_name(&self) -> String {
        self.push_host.clone()
    }
}

/// Build an authenticated octocrab instance, optionally against another API base
pub fn build_octocrab(token: &str, api_url: Option<&str>) -> Result<Octocrab> {
    let mut builder = Octocrab::builder().personal_token(token.to_string());

    if let Some(url) = api_url {
        builder = builder
            .base_uri(url)
            .with_context(|| format!("Invalid GitHub API URL: {}", url))?;
    }

    builder.build().context("Failed to create GitHub client")
}

fn looks_like_github_token(token: &str) -> bool {
    ["ghp_", "gho_", "ghs_", "ghu_", "github_pat_"]
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

/// Check if a command is available in PATH
fn is_command_available(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Utility functions for GitHub authentication setup
pub mod auth_setup {
    use super::*;

    /// Interactive authentication setup guide
    pub async fn setup_authentication() -> Result<()> {
        println!("🔧 github-sync Authentication Setup");
        println!();

        if is_command_available("gh") {
            println!("✅ GitHub CLI (gh) is installed");

            if Command::new("gh").args(["auth", "status"]).output()?.status.success() {
                println!("✅ GitHub CLI is already authenticated");
            } else {
                println!("🔄 GitHub CLI needs authentication");
                println!("Run: gh auth login --scopes repo");
            }
            return Ok(());
        }

        println!("❌ GitHub CLI (gh) is not installed");
        println!();
        println!("Recommended setup:");
        println!("1. Install GitHub CLI:");

        #[cfg(target_os = "macos")]
        println!("   brew install gh");

        #[cfg(target_os = "linux")]
        println!("   See: https://github.com/cli/cli/blob/trunk/docs/install_linux.md");

        #[cfg(target_os = "windows")]
        println!("   winget install --id GitHub.cli");

        println!();
        println!("2. Authenticate:");
        println!("   gh auth login --scopes repo");
        println!();
        println!("Alternative: Set GITHUB_TOKEN to a token with the 'repo' scope");
        println!("   export GITHUB_TOKEN=your_token_here");

        Ok(())
    }

    /// Test current authentication
    pub async fn test_authentication(config: &Config) -> Result<()> {
        println!("🔍 Testing GitHub authentication...");

        match GitHubClient::new(config).await {
            Ok(client) => {
                println!("✅ Authentication successful");
                println!("   Username: {}", client.username());

                match client.list_user_organizations().await {
                    Ok(orgs) if orgs.is_empty() => println!("   Organizations: None"),
                    Ok(orgs) => println!("   Organizations: {}", orgs.join(", ")),
                    Err(e) => println!("⚠️  Could not list organizations: {}", e),
                }
            }
            Err(e) => {
                println!("❌ Authentication failed: {}", e);
                println!();
                println!("To fix this, run: github-sync auth setup");
            }
        }

        Ok(())
    }
}
