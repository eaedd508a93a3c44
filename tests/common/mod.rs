//! Common test utilities and helpers for github-sync tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use github_sync::config::RepositoryEntry;
use github_sync::{Config, MirrorHost, MirrorSpec, Provision};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

/// Run git with a fixed identity, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=github-sync tests",
            "-c",
            "user.email=tests@example.org",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "tag.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("Failed to run git");

    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );

    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// `refname -> oid` of every branch and tag in a repository
pub fn refs(repo: &Path) -> Vec<(String, String)> {
    let out = git(
        repo,
        &["for-each-ref", "--format=%(refname) %(objectname)", "refs/heads", "refs/tags"],
    );

    out.lines()
        .filter_map(|line| line.split_once(' '))
        .map(|(name, oid)| (name.to_string(), oid.to_string()))
        .collect()
}

pub fn ref_names(repo: &Path) -> Vec<String> {
    refs(repo).into_iter().map(|(name, _)| name).collect()
}

/// A working repository standing in for the upstream (non-GitHub) host
pub struct Upstream {
    pub path: PathBuf,
}

impl Upstream {
    /// Repository with `main`, `feature` and tag `v1.0`
    pub fn create(root: &Path, name: &str) -> Self {
        let path = root.join(name);
        std::fs::create_dir_all(&path).expect("Failed to create upstream dir");

        git(&path, &["init", "--quiet"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let upstream = Self { path };
        upstream.commit("initial commit");
        git(&upstream.path, &["branch", "feature"]);
        git(&upstream.path, &["tag", "v1.0"]);
        upstream
    }

    pub fn commit(&self, message: &str) {
        git(&self.path, &["commit", "--allow-empty", "--quiet", "-m", message]);
    }

    pub fn delete_branch(&self, branch: &str) {
        git(&self.path, &["branch", "-D", branch]);
    }

    pub fn url(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

/// Host backed by bare repositories on disk, laid out as `<root>/<owner>/<name>.git`
pub struct LocalHost {
    pub root: PathBuf,
    pub created: Mutex<Vec<String>>,
}

impl LocalHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn repo_path(&self, spec: &MirrorSpec) -> PathBuf {
        self.root.join(&spec.owner).join(format!("{}.git", spec.name))
    }

    pub fn repo_path_for(&self, owner: &str, name: &str) -> PathBuf {
        self.root.join(owner).join(format!("{}.git", name))
    }
}

#[async_trait]
impl MirrorHost for LocalHost {
    async fn ensure_repository(&self, spec: &MirrorSpec) -> Result<Provision> {
        let path = self.repo_path(spec);
        if path.join("HEAD").exists() {
            return Ok(Provision::Existing);
        }

        std::fs::create_dir_all(&path)?;
        git(&path, &["init", "--bare", "--quiet"]);
        self.created
            .lock()
            .expect("lock poisoned")
            .push(spec.full_name());

        Ok(Provision::Created)
    }

    async fn repository_exists(&self, spec: &MirrorSpec) -> Result<bool> {
        Ok(self.repo_path(spec).join("HEAD").exists())
    }

    fn push_url(&self, spec: &MirrorSpec) -> String {
        self.repo_path(spec).to_string_lossy().to_string()
    }

    fn secret(&self) -> Option<String> {
        None
    }

    fn host_name(&self) -> String {
        "local".to_string()
    }
}

/// Scratch layout for a mirroring test
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn upstream(&self, name: &str) -> Upstream {
        Upstream::create(&self.path().join("upstream"), name)
    }

    pub fn host(&self) -> LocalHost {
        LocalHost::new(self.path().join("github"))
    }

    /// Configuration mirroring `sources` for owner `octocat`
    pub fn config(&self, sources: &[String]) -> Config {
        let mut config = Config::default();
        config.cache_directory = self.path().join("cache").to_string_lossy().to_string();
        config.state.database = self.path().join("state.db").to_string_lossy().to_string();
        config.daemon.pid_file = self.path().join("github-sync.pid").to_string_lossy().to_string();
        config.github.owner = Some("octocat".to_string());
        config.repositories = sources
            .iter()
            .map(|source| RepositoryEntry::Url(source.clone()))
            .collect();
        config
    }

    pub fn write_config(&self, content: &str) -> PathBuf {
        let config_path = self.path().join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
