use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `loom.toml`.
///
/// **Security**: this struct never stores API keys or tokens. Provider
/// credentials are referenced by environment variable name (`key_ref`) and
/// resolved at call time.
///
/// The orchestrator snapshots the config at initialize and exposes it
/// through immutable accessors; a reload goes through
/// `Loom::apply_snapshot`, which stops and restarts dependent workers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl Config {
    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "agents.max_concurrent must be at least 1".into(),
            ));
        }
        if self.dispatch.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "dispatch.max_iterations must be at least 1".into(),
            ));
        }
        for project in &self.projects {
            if project.id.is_empty() {
                return Err(ConfigError::Validation("project id must be non-empty".into()));
            }
        }
        Ok(())
    }

    pub fn project(&self, id: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.id == id)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root under which project workspaces live:
    /// `<base_dir>/<project>/main` and `<base_dir>/<project>/beads`.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path of the SQLite mirror.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            log_level: default_log_level(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Workers per project-executor group.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Agents in `working` with no activity for this long are reset. One
    /// threshold covers every stuck-reset path, including the maintenance
    /// ticker; agents whose bead has vanished or closed reset regardless
    /// of age.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// Persona agents idle longer than this many days are retired.
    #[serde(default = "default_retire_after_days")]
    pub retire_after_days: u32,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            retire_after_days: default_retire_after_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Executor tick when no wake signal arrives.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Action/completion iterations per bead before backing off.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Conversation token budget per bead.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Maintenance ticker interval.
    #[serde(default = "default_maintenance_secs")]
    pub maintenance_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            max_iterations: default_max_iterations(),
            token_budget: default_token_budget(),
            maintenance_secs: default_maintenance_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Sync-coordinator commit interval.
    #[serde(default = "default_sync_secs")]
    pub sync_secs: u64,
    /// Branch the beads worktree is checked out on.
    #[serde(default = "default_sync_branch")]
    pub sync_branch: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            sync_secs: default_sync_secs(),
            sync_branch: default_sync_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_chat_secs")]
    pub chat_secs: u64,
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    #[serde(default = "default_git_probe_secs")]
    pub git_probe_secs: u64,
    #[serde(default = "default_shell_secs")]
    pub shell_secs: u64,
    #[serde(default = "default_readiness_ttl_secs")]
    pub readiness_ttl_secs: u64,
    #[serde(default = "default_file_lock_secs")]
    pub file_lock_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            chat_secs: default_chat_secs(),
            probe_secs: default_probe_secs(),
            git_probe_secs: default_git_probe_secs(),
            shell_secs: default_shell_secs(),
            readiness_ttl_secs: default_readiness_ttl_secs(),
            file_lock_secs: default_file_lock_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn chat(&self) -> Duration {
        Duration::from_secs(self.chat_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn git_probe(&self) -> Duration {
        Duration::from_secs(self.git_probe_secs)
    }

    pub fn shell(&self) -> Duration {
        Duration::from_secs(self.shell_secs)
    }

    pub fn readiness_ttl(&self) -> Duration {
        Duration::from_secs(self.readiness_ttl_secs)
    }

    pub fn file_lock(&self) -> Duration {
        Duration::from_secs(self.file_lock_secs)
    }
}

/// How the project authenticates against its git remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GitAuthMode {
    #[default]
    None,
    Ssh,
    Token,
    Helper,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub git_auth: GitAuthMode,
    /// Env var holding the token for `GitAuthMode::Token`.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Create a dedicated worktree per (project, bead) at claim time.
    #[serde(default)]
    pub per_agent_worktrees: bool,
    /// Override for the beads path; defaults to `<base>/<id>/beads`.
    #[serde(default)]
    pub beads_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/loom")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("loom.db")
}

fn default_max_concurrent() -> u32 {
    4
}

fn default_stuck_threshold_secs() -> u64 {
    300
}

fn default_retire_after_days() -> u32 {
    30
}

fn default_tick_secs() -> u64 {
    30
}

fn default_max_iterations() -> u32 {
    100
}

fn default_token_budget() -> usize {
    32_000
}

fn default_maintenance_secs() -> u64 {
    60
}

fn default_sync_secs() -> u64 {
    30
}

fn default_sync_branch() -> String {
    "loom-sync".to_string()
}

fn default_chat_secs() -> u64 {
    60
}

fn default_probe_secs() -> u64 {
    30
}

fn default_git_probe_secs() -> u64 {
    15
}

fn default_shell_secs() -> u64 {
    300
}

fn default_readiness_ttl_secs() -> u64 {
    120
}

fn default_file_lock_secs() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.dispatch.tick_secs, 30);
        assert_eq!(cfg.dispatch.max_iterations, 100);
        assert_eq!(cfg.timeouts.readiness_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn parse_minimal_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [[projects]]
            id = "alpha"
            git_auth = "ssh"
            repo_url = "git@example.com:org/alpha.git"
            per_agent_worktrees = true
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        let project = cfg.project("alpha").unwrap();
        assert_eq!(project.git_auth, GitAuthMode::Ssh);
        assert!(project.per_agent_worktrees);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg: Config = toml::from_str("[agents]\nmax_concurrent = 0\n").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn toml_roundtrip() {
        let mut cfg = Config::default();
        cfg.projects.push(ProjectConfig {
            id: "p".into(),
            ..Default::default()
        });
        let text = cfg.to_toml().unwrap();
        let parsed = toml::from_str::<Config>(&text).unwrap();
        assert_eq!(parsed.projects.len(), 1);
    }
}
