//! Mirror sources
//!
//! Turns configured repository entries into [`MirrorSpec`]s: where the upstream
//! lives, which GitHub repository it is pushed to and where its bare cache sits.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::config::{Config, MirrorEntry};
use crate::git::{redact, strip_userinfo};

/// Everything needed to mirror one upstream repository onto GitHub
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSpec {
    /// Destination repository name (e.g., "github-sync")
    pub name: String,

    /// Destination owner, user or organization
    pub owner: String,

    /// Upstream repository URL
    pub source_url: String,

    pub description: Option<String>,

    pub homepage: Option<String>,

    /// Visibility used when the destination is created
    pub private: bool,

    /// Bare mirror cache location
    pub cache_path: PathBuf,
}

impl MirrorSpec {
    /// Check if the bare mirror cache already exists
    pub fn exists_locally(&self) -> bool {
        self.cache_path.join("HEAD").exists()
    }

    /// Destination in owner/name format
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Derive a GitHub repository name from an upstream URL.
///
/// Handles `https://`, `git://`, `ssh://`, scp-like `user@host:path` and local
/// paths. Trailing slashes and a `.git` suffix are dropped.
pub fn derive_repo_name(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let last = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or_default();

    sanitize_repo_name(last).with_context(|| format!("Cannot derive repository name from {}", url))
}

/// Replace characters GitHub does not accept in repository names
pub fn sanitize_repo_name(raw: &str) -> Result<String> {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"));

    let cleaned = invalid.replace_all(raw, "-");
    let cleaned = cleaned.trim_matches('-');

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return Err(anyhow!("Invalid repository name: {:?}", raw));
    }

    Ok(cleaned.to_string())
}

/// Simple `*` glob match against a repository name
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern.contains('*') {
        let pattern_regex = regex::escape(pattern).replace(r"\*", ".*");

        Regex::new(&format!("^{}$", pattern_regex))
            .map(|re| re.is_match(name))
            .unwrap_or(false)
    } else {
        name == pattern
    }
}

/// Parse a repository list file: one URL per line, `#` starts a comment
pub fn parse_repository_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Builds specs from entries using configuration defaults
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    config: Arc<Config>,
    default_owner: String,
}

impl SpecBuilder {
    pub fn new(config: Arc<Config>, default_owner: impl Into<String>) -> Self {
        Self {
            config,
            default_owner: default_owner.into(),
        }
    }

    pub fn build(&self, entry: &MirrorEntry) -> Result<MirrorSpec> {
        let source_url = entry.source.trim().to_string();
        if source_url.is_empty() {
            return Err(anyhow!("Repository entry has an empty source URL"));
        }

        let name = match &entry.name {
            Some(name) => sanitize_repo_name(name)?,
            None => {
                let derived = derive_repo_name(&source_url)?;
                match &self.config.github.name_prefix {
                    Some(prefix) => sanitize_repo_name(&format!("{}{}", prefix, derived))?,
                    None => derived,
                }
            }
        };

        let owner = entry
            .owner
            .clone()
            .unwrap_or_else(|| self.default_owner.clone());

        let public_url = strip_userinfo(&source_url);
        let homepage = entry.homepage.clone().or_else(|| {
            (public_url.starts_with("https://") || public_url.starts_with("http://"))
                .then(|| public_url.clone())
        });

        let cache_path = self
            .config
            .cache_path()
            .join(&owner)
            .join(format!("{}.git", name));

        Ok(MirrorSpec {
            description: Some(
                entry
                    .description
                    .clone()
                    .unwrap_or_else(|| self.config.describe(&public_url)),
            ),
            homepage,
            private: entry.private.unwrap_or(self.config.github.private),
            name,
            owner,
            source_url,
            cache_path,
        })
    }
}

/// Trait for places repositories to mirror can be listed from
#[async_trait]
pub trait MirrorSource: Send + Sync {
    /// List the mirrors this source knows about
    async fn discover(&self) -> Result<Vec<MirrorSpec>>;

    /// Source name for display/logging
    fn source_name(&self) -> &'static str;

    /// Whether this source can be read at all
    async fn is_available(&self) -> bool;
}

/// The `repositories` list of the configuration file
pub struct ConfigSource {
    builder: SpecBuilder,
}

impl ConfigSource {
    pub fn new(builder: SpecBuilder) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl MirrorSource for ConfigSource {
    async fn discover(&self) -> Result<Vec<MirrorSpec>> {
        let mut specs = Vec::new();

        for entry in &self.builder.config.repositories {
            match self.builder.build(&entry.to_entry()) {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!("Ignoring repository {}: {:#}", entry.source(), e),
            }
        }

        Ok(specs)
    }

    fn source_name(&self) -> &'static str {
        "configuration"
    }

    async fn is_available(&self) -> bool {
        !self.builder.config.repositories.is_empty()
    }
}

/// A plain-text list of source URLs
pub struct ListFileSource {
    path: PathBuf,
    builder: SpecBuilder,
}

impl ListFileSource {
    pub fn new(path: impl Into<PathBuf>, builder: SpecBuilder) -> Self {
        Self {
            path: path.into(),
            builder,
        }
    }
}

#[async_trait]
impl MirrorSource for ListFileSource {
    async fn discover(&self) -> Result<Vec<MirrorSpec>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read repository list {}", self.path.display()))?;

        let mut specs = Vec::new();

        for url in parse_repository_list(&content) {
            let entry = MirrorEntry {
                source: url,
                ..Default::default()
            };
            match self.builder.build(&entry) {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!("Ignoring line in {}: {:#}", self.path.display(), e),
            }
        }

        Ok(specs)
    }

    fn source_name(&self) -> &'static str {
        "repository list"
    }

    async fn is_available(&self) -> bool {
        self.path.exists()
    }
}

/// Aggregates multiple sources
pub struct MultiSource {
    sources: Vec<Box<dyn MirrorSource>>,
    exclude_patterns: Vec<String>,
}

impl MultiSource {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Build the standard set of sources from configuration
    pub fn from_config(config: Arc<Config>, default_owner: impl Into<String>) -> Self {
        let builder = SpecBuilder::new(config.clone(), default_owner);
        let mut multi = Self::new().with_exclusions(config.github.exclude_patterns.clone());

        multi.add_source(Box::new(ConfigSource::new(builder.clone())));
        if let Some(file) = &config.repositories_file {
            multi.add_source(Box::new(ListFileSource::new(file, builder)));
        }

        multi
    }

    pub fn with_exclusions(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    pub fn add_source(&mut self, source: Box<dyn MirrorSource>) {
        self.sources.push(source);
    }

    /// Discover from all sources, dropping duplicates and excluded names
    pub async fn discover_all(&self) -> Result<Vec<MirrorSpec>> {
        let mut all_specs = Vec::new();
        let mut seen = HashSet::new();

        for source in &self.sources {
            if !source.is_available().await {
                debug!("Source {} not available, skipping", source.source_name());
                continue;
            }

            let specs = match source.discover().await {
                Ok(specs) => specs,
                Err(e) => {
                    warn!("Failed to read {}: {:#}", source.source_name(), e);
                    continue;
                }
            };

            info!("Found {} repositories in {}", specs.len(), source.source_name());

            for spec in specs {
                if self
                    .exclude_patterns
                    .iter()
                    .any(|pattern| matches_pattern(&spec.name, pattern))
                {
                    debug!("Excluding repository due to pattern match: {}", spec.name);
                    continue;
                }

                if !seen.insert(spec.full_name().to_lowercase()) {
                    warn!(
                        "Duplicate mirror target {} (from {}), keeping the first one",
                        spec.full_name(),
                        redact(&spec.source_url, None)
                    );
                    continue;
                }

                all_specs.push(spec);
            }
        }

        Ok(all_specs)
    }
}

impl Default for MultiSource {
    fn default() -> Self {
        Self::new()
    }
}
