use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for github-sync
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory holding the bare mirror caches
    #[serde(default = "default_cache_directory")]
    pub cache_directory: String,

    /// GitHub authentication and destination settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Mirroring behavior settings
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Repositories to mirror
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,

    /// Optional plain-text file with one source URL per line
    #[serde(default)]
    pub repositories_file: Option<String>,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Persistent state tracking
    #[serde(default)]
    pub state: StateConfig,
}

/// A repository to mirror: either a bare URL or a detailed mapping
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum RepositoryEntry {
    Url(String),
    Detailed(MirrorEntry),
}

/// Detailed repository entry
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct MirrorEntry {
    /// Upstream repository URL
    pub source: String,

    /// Destination repository name (derived from the source URL if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Destination owner (defaults to github.owner or the authenticated user)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    /// Visibility override used when the GitHub repository is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
}

impl RepositoryEntry {
    /// Normalize to the detailed form
    pub fn to_entry(&self) -> MirrorEntry {
        match self {
            RepositoryEntry::Url(url) => MirrorEntry {
                source: url.clone(),
                ..Default::default()
            },
            RepositoryEntry::Detailed(entry) => entry.clone(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            RepositoryEntry::Url(url) => url,
            RepositoryEntry::Detailed(entry) => &entry.source,
        }
    }
}

/// Protocol used to push to GitHub
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushMethod {
    /// https://x-access-token:<token>@github.com/owner/repo.git
    #[default]
    Https,
    /// git@github.com:owner/repo.git
    Ssh,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// GitHub username (auto-detected if null)
    pub username: Option<String>,

    /// Default destination owner (user or organization)
    pub owner: Option<String>,

    /// API base URL, for GitHub Enterprise
    pub api_url: Option<String>,

    /// Host used in push URLs
    #[serde(default = "default_push_host")]
    pub push_host: String,

    #[serde(default)]
    pub push_method: PushMethod,

    /// Create mirrors as private repositories
    #[serde(default)]
    pub private: bool,

    /// Prefix added to derived repository names
    pub name_prefix: Option<String>,

    /// Description for created repositories; `{source}` is replaced by the source URL
    #[serde(default = "default_description_template")]
    pub description_template: String,

    /// Patch description/homepage of existing repositories when they drift
    #[serde(default = "default_true")]
    pub update_metadata: bool,

    /// Repository exclusion patterns
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Mirroring configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MirrorConfig {
    /// Maximum parallel mirror operations
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for a single mirror operation in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Refspecs pushed to GitHub
    #[serde(default = "default_refspecs")]
    pub refspecs: Vec<String>,

    /// Delete destination refs that no longer exist upstream
    #[serde(default = "default_true")]
    pub prune: bool,

    /// Skip the push when the fetch brought nothing new and the last run succeeded
    #[serde(default = "default_true")]
    pub skip_unchanged: bool,

    /// Backoff policy for rate-limited API calls
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry configuration for rate-limited GitHub API calls
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String, // "2s"

    #[serde(default = "default_max_backoff")]
    pub max_backoff: String, // "5m"
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Sync interval
    #[serde(default = "default_interval")]
    pub interval: String, // "30m"

    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "full"
}

/// State database configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_database")]
    pub database: String,
}

// Default value functions
fn default_cache_directory() -> String {
    if let Ok(cache_home) = std::env::var("XDG_CACHE_HOME") {
        format!("{}/github-sync", cache_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.cache/github-sync", home)
    } else {
        "/tmp/github-sync".to_string()
    }
}
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_push_host() -> String {
    "github.com".to_string()
}
fn default_description_template() -> String {
    "Mirror of {source}".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_parallel() -> usize {
    4
}
fn default_timeout() -> u64 {
    600
}
fn default_refspecs() -> Vec<String> {
    vec![
        "+refs/heads/*:refs/heads/*".to_string(),
        "+refs/tags/*:refs/tags/*".to_string(),
    ]
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> String {
    "2s".to_string()
}
fn default_max_backoff() -> String {
    "5m".to_string()
}
fn default_interval() -> String {
    "30m".to_string()
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/github-sync.pid", runtime_dir)
    } else {
        "/tmp/github-sync.pid".to_string()
    }
}
fn default_log_file() -> String {
    format!("{}/daemon.log", data_home())
}
fn default_database() -> String {
    format!("{}/state.db", data_home())
}
fn data_home() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/github-sync", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/github-sync", home)
    } else {
        "/tmp/github-sync-data".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            username: None,
            owner: None,
            api_url: None,
            push_host: default_push_host(),
            push_method: PushMethod::default(),
            private: false,
            name_prefix: None,
            description_template: default_description_template(),
            update_metadata: default_true(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout: default_timeout(),
            refspecs: default_refspecs(),
            prune: default_true(),
            skip_unchanged: default_true(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            database: default_database(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_directory: default_cache_directory(),
            github: GitHubConfig::default(),
            mirror: MirrorConfig::default(),
            repositories: Vec::new(),
            repositories_file: None,
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("github-sync").join("config.yml"))
    }

    /// Expand environment variables and `~` in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.cache_directory = expand_path(&self.cache_directory, "cache_directory")?;
        self.daemon.pid_file = expand_path(&self.daemon.pid_file, "pid_file")?;
        self.daemon.log_file = expand_path(&self.daemon.log_file, "log_file")?;
        self.state.database = expand_path(&self.state.database, "state database")?;

        if let Some(file) = &self.repositories_file {
            self.repositories_file = Some(expand_path(file, "repositories_file")?);
        }

        Ok(())
    }

    /// Cache directory as a path
    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_directory)
    }

    /// Daemon sync interval
    pub fn sync_interval(&self) -> Result<Duration> {
        let seconds = parse_duration(&self.daemon.interval)
            .context("Failed to parse daemon sync interval")?;

        if seconds == 0 {
            return Err(anyhow!("Daemon sync interval must be greater than zero"));
        }

        Ok(Duration::from_secs(seconds))
    }

    /// Description for a newly created mirror
    pub fn describe(&self, source: &str) -> String {
        self.github.description_template.replace("{source}", source)
    }
}

fn expand_path(raw: &str, what: &str) -> Result<String> {
    if raw.is_empty() {
        return Ok(String::new());
    }

    let expanded = shellexpand::full(raw)
        .with_context(|| format!("Failed to expand {} path", what))?;

    Ok(PathBuf::from(expanded.as_ref())
        .clean()
        .to_string_lossy()
        .into_owned())
}

/// Parse duration strings like "30s", "15m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    if duration_str.is_empty() {
        return Err(anyhow!("Empty duration"));
    }

    let scaled = |value: &str, unit: u64, what: &str| -> Result<u64> {
        value
            .parse::<u64>()
            .with_context(|| format!("Invalid {} value", what))?
            .checked_mul(unit)
            .ok_or_else(|| anyhow!("Duration too large"))
    };

    if let Some(value) = duration_str.strip_suffix('s') {
        scaled(value, 1, "seconds")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        scaled(value, 60, "minutes")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        scaled(value, 3600, "hours")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        scaled(value, 86400, "days")
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn setup_test_config_dir() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("github-sync");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        (temp_dir, config_dir)
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert!(config.cache_directory.ends_with("github-sync"));
        assert_eq!(config.github.auth_method, "auto");
        assert_eq!(config.github.push_host, "github.com");
        assert_eq!(config.github.push_method, PushMethod::Https);
        assert!(!config.github.private);
        assert!(config.github.update_metadata);
        assert_eq!(config.mirror.max_parallel, 4);
        assert_eq!(config.mirror.timeout, 600);
        assert_eq!(config.mirror.refspecs.len(), 2);
        assert!(config.mirror.prune);
        assert!(config.mirror.skip_unchanged);
        assert_eq!(config.mirror.retry.max_attempts, 5);
        assert!(config.repositories.is_empty());
        assert!(config.state.enabled);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("15m").unwrap(), 900);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("2d").unwrap(), 172_800);
        assert_eq!(parse_duration(" 90 ").unwrap(), 90);
        assert_eq!(parse_duration("1H").unwrap(), 3600);

        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        let err = parse_duration("999999999999999d").unwrap_err();
        assert!(err.to_string().contains("Duration too large"));
        assert!(parse_duration("999999999999999999h").is_err());
    }

    #[test]
    fn test_sync_interval_rejects_zero() {
        let mut config = Config::default();

        for zero in ["0", "0s", "0m"] {
            config.daemon.interval = zero.to_string();
            let err = config.sync_interval().unwrap_err();
            assert!(format!("{:#}", err).contains("greater than zero"));
        }

        config.daemon.interval = "5m".to_string();
        assert_eq!(config.sync_interval().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_sync_interval() {
        let mut config = Config::default();
        assert_eq!(config.sync_interval().unwrap(), Duration::from_secs(1800));

        config.daemon.interval = "bogus".to_string();
        assert!(config.sync_interval().is_err());
    }

    #[test]
    fn test_describe_template() {
        let mut config = Config::default();
        assert_eq!(
            config.describe("https://git.example.org/foo.git"),
            "Mirror of https://git.example.org/foo.git"
        );

        config.github.description_template = "Read-only copy".to_string();
        assert_eq!(config.describe("https://git.example.org/foo.git"), "Read-only copy");
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_GITHUB_SYNC_HOME", "/test/home");

        let mut config = Config::default();
        config.cache_directory = "${TEST_GITHUB_SYNC_HOME}/cache/../mirrors".to_string();
        config.repositories_file = Some("$TEST_GITHUB_SYNC_HOME/repos.txt".to_string());

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.cache_directory, "/test/home/mirrors");
        assert_eq!(
            config.repositories_file.as_deref(),
            Some("/test/home/repos.txt")
        );

        env::remove_var("TEST_GITHUB_SYNC_HOME");
    }

    #[test]
    fn test_expand_paths_keeps_empty_values() {
        let mut config = Config::default();
        config.daemon.pid_file = String::new();
        config.expand_paths().unwrap();
        assert!(config.daemon.pid_file.is_empty());
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let nonexistent_path = Path::new("/nonexistent/path/config.yml");
        let result = Config::load(nonexistent_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let config_path = config_dir.join("config.yml");

        let mut config = Config::default();
        config.cache_directory = "/custom/cache".to_string();
        config.github.owner = Some("mirrors".to_string());
        config.mirror.max_parallel = 8;
        config.repositories = vec![
            RepositoryEntry::Url("https://git.example.org/a.git".to_string()),
            RepositoryEntry::Detailed(MirrorEntry {
                source: "https://git.example.org/b.git".to_string(),
                name: Some("bee".to_string()),
                ..Default::default()
            }),
        ];

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.cache_directory, "/custom/cache");
        assert_eq!(loaded.github.owner, Some("mirrors".to_string()));
        assert_eq!(loaded.mirror.max_parallel, 8);
        assert_eq!(loaded.repositories, config.repositories);
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("github-sync"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
cache_directory: "/srv/mirrors"
github:
  auth_method: "token"
  owner: "mirror-org"
  api_url: "https://ghe.example.com/api/v3"
  push_method: "ssh"
  private: true
  name_prefix: "upstream-"
  exclude_patterns: ["scratch-*"]
mirror:
  max_parallel: 2
  timeout: 120
  prune: false
  retry:
    max_attempts: 3
    initial_backoff: "1s"
repositories:
  - https://salsa.debian.org/lamby/foo.git
  - source: git://git.example.org/bar
    name: bar-mirror
    owner: other
    description: "Bar"
    private: false
daemon:
  interval: "1h"
logging:
  level: "debug"
  format: "full"
state:
  enabled: false
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.cache_directory, "/srv/mirrors");
        assert_eq!(config.github.auth_method, "token");
        assert_eq!(config.github.owner.as_deref(), Some("mirror-org"));
        assert_eq!(config.github.push_method, PushMethod::Ssh);
        assert!(config.github.private);
        assert_eq!(config.github.name_prefix.as_deref(), Some("upstream-"));
        assert_eq!(config.github.exclude_patterns, vec!["scratch-*".to_string()]);
        assert_eq!(config.github.push_host, "github.com");
        assert_eq!(config.mirror.max_parallel, 2);
        assert_eq!(config.mirror.timeout, 120);
        assert!(!config.mirror.prune);
        assert!(config.mirror.skip_unchanged);
        assert_eq!(config.mirror.retry.max_attempts, 3);
        assert_eq!(config.mirror.retry.initial_backoff, "1s");
        assert_eq!(config.mirror.retry.max_backoff, "5m");
        assert_eq!(config.daemon.interval, "1h");
        assert_eq!(config.logging.format, "full");
        assert!(!config.state.enabled);

        assert_eq!(config.repositories.len(), 2);
        assert_eq!(
            config.repositories[0],
            RepositoryEntry::Url("https://salsa.debian.org/lamby/foo.git".to_string())
        );
        let bar = config.repositories[1].to_entry();
        assert_eq!(bar.source, "git://git.example.org/bar");
        assert_eq!(bar.name.as_deref(), Some("bar-mirror"));
        assert_eq!(bar.owner.as_deref(), Some("other"));
        assert_eq!(bar.private, Some(false));
        assert_eq!(config.repositories[1].source(), "git://git.example.org/bar");
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(include_str!("../config.example.yml"))
            .expect("config.example.yml should parse");

        assert_eq!(config.repositories.len(), 3);
        assert_eq!(config.github.owner.as_deref(), Some("my-org"));
        assert_eq!(config.mirror.refspecs, default_refspecs());
        assert!(config.repositories_file.is_none());
    }
}
