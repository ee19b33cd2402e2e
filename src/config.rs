use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::AgentType;
use crate::{Error, Result};

pub const DEFAULT_INTEGRATION_BRANCH: &str = "integration";

/// Orchestrator configuration, read from `~/.foreman/foreman.toml`.
///
/// Every field has a default so an empty (or missing) file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database shared by every orchestrator process and worker.
    pub db_path: Option<String>,
    /// Repository whose integration branch receives merged work.
    pub repo_path: Option<String>,
    pub integration_branch: String,
    pub worktree_dir: Option<String>,
    /// Command used to launch workers; agent arguments are appended.
    pub agent_command: Option<String>,
    /// Agent type that receives Level-2 bug reports.
    pub remediation_agent: String,
    /// Let `recursive` merges attempt automatic resolution of conflicts.
    pub resolve_conflicts: bool,

    pub tick_interval_secs: u64,
    pub health_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub agent_timeout_secs: u64,
    pub stall_threshold_secs: u64,
    pub freeze_threshold_secs: u64,
    pub merge_stale_secs: u64,
    pub git_timeout_secs: u64,

    pub max_restarts: u32,
    pub backoff_base_secs: u64,
    pub max_spawn_attempts: u32,

    /// One-minute load average divided by CPU count.
    pub max_cpu_load: f64,
    /// Fraction of physical memory in use.
    pub max_memory_used: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            repo_path: None,
            integration_branch: DEFAULT_INTEGRATION_BRANCH.to_string(),
            worktree_dir: None,
            agent_command: None,
            remediation_agent: AgentType::BugFixer.to_string(),
            resolve_conflicts: false,
            tick_interval_secs: 5,
            health_interval_secs: 30,
            startup_timeout_secs: 10,
            agent_timeout_secs: 3600,
            stall_threshold_secs: 60,
            freeze_threshold_secs: 300,
            merge_stale_secs: 900,
            git_timeout_secs: 120,
            max_restarts: 3,
            backoff_base_secs: 2,
            max_spawn_attempts: 3,
            max_cpu_load: 0.9,
            max_memory_used: 0.9,
        }
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.log"))
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::foreman_dir()?.join("foreman.db")),
        }
    }

    pub fn repo_path(&self) -> Result<PathBuf> {
        match &self.repo_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("worktrees")),
        }
    }

    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or("foreman-agent")
    }

    pub fn remediation_agent(&self) -> AgentType {
        self.remediation_agent
            .parse()
            .unwrap_or(AgentType::BugFixer)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn freeze_threshold(&self) -> Duration {
        Duration::from_secs(self.freeze_threshold_secs)
    }

    pub fn merge_stale_threshold(&self) -> Duration {
        Duration::from_secs(self.merge_stale_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            integration_branch = %config.integration_branch,
            db_path = ?config.db_path,
            agent_command = ?config.agent_command,
            "config loaded"
        );
        Ok(config)
    }

    /// Overrides: `FOREMAN_DB`, `FOREMAN_REPO`, `FOREMAN_INTEGRATION_BRANCH`,
    /// `RESOLVE_CONFLICTS`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup("FOREMAN_DB") {
            self.db_path = Some(db);
        }
        if let Some(repo) = lookup("FOREMAN_REPO") {
            self.repo_path = Some(repo);
        }
        if let Some(branch) = lookup("FOREMAN_INTEGRATION_BRANCH") {
            if !branch.trim().is_empty() {
                self.integration_branch = branch.trim().to_string();
            }
        }
        if let Some(resolve) = lookup("RESOLVE_CONFLICTS") {
            self.resolve_conflicts = resolve == "1" || resolve.eq_ignore_ascii_case("true");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.integration_branch.trim().is_empty() {
            return Err(Error::Validation(
                "integration_branch must not be empty".to_string(),
            ));
        }
        if self.max_restarts == 0 {
            return Err(Error::Validation("max_restarts must be at least 1".to_string()));
        }
        for (name, value) in [
            ("max_cpu_load", self.max_cpu_load),
            ("max_memory_used", self.max_memory_used),
        ] {
            if value <= 0.0 {
                return Err(Error::Validation(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let foreman_dir = Self::foreman_dir()?;
        if !foreman_dir.exists() {
            debug!("creating foreman directory");
            fs::create_dir_all(&foreman_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let worktrees_dir = self.worktrees_dir()?;
        let db_path = self.db_path()?;
        if let Some(db_dir) = db_path.parent() {
            if !db_dir.as_os_str().is_empty() && !db_dir.exists() {
                debug!(dir = %db_dir.display(), "creating database directory");
                fs::create_dir_all(db_dir)?;
            }
        }
        if !worktrees_dir.exists() {
            debug!(dir = %worktrees_dir.display(), "creating worktrees directory");
            fs::create_dir_all(&worktrees_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
