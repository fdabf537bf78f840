//! Per-project readiness gating.
//!
//! Dispatch never runs against a project that fails preflight: the project
//! must exist, its git auth must be workable, and its beads path must be
//! present. Results are cached per project with a fixed TTL. A failed check
//! gets one self-heal pass (create the beads path, retry token auth); if
//! the project is still not ready, a P3 readiness bead is auto-filed,
//! deduplicated while one is open and throttled to one per four hours.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use loom_core::config::{GitAuthMode, ProjectConfig};
use loom_core::types::{BeadStatus, BeadType, Priority};
use loom_store::store::{BeadFilter, BeadStore};
use tracing::{info, warn};

pub const READINESS_TTL: Duration = Duration::from_secs(120);
pub const READINESS_BEAD_THROTTLE: chrono::Duration = chrono::Duration::hours(4);
pub const READINESS_TAG: &str = "readiness";
pub const HUMAN_CONFIG_TAG: &str = "requires-human-config";

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessReport {
    pub ready: bool,
    pub issues: Vec<String>,
}

impl ReadinessReport {
    fn ready() -> Self {
        Self {
            ready: true,
            issues: Vec::new(),
        }
    }
}

/// Git-auth collaborator; the real one shells out to ssh-keygen and
/// `git ls-remote`, tests count invocations.
pub trait GitAuthProbe: Send + Sync {
    /// Ensure a project keypair exists at `key_path`, generating one on
    /// first use. Returns whether a keypair is available afterwards.
    fn ensure_keypair(&self, key_path: &Path) -> bool;
    /// Lightweight remote-reachability probe (bounded to ~15s).
    fn remote_reachable(&self, repo_url: &str, key_path: Option<&Path>) -> bool;
}

/// Default probe backed by ssh-keygen and git.
pub struct CliGitAuthProbe {
    probe_timeout: Duration,
}

impl CliGitAuthProbe {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }
}

impl GitAuthProbe for CliGitAuthProbe {
    fn ensure_keypair(&self, key_path: &Path) -> bool {
        if key_path.exists() {
            return true;
        }
        if let Some(parent) = key_path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        std::process::Command::new("ssh-keygen")
            .args(["-t", "ed25519", "-N", "", "-q", "-f"])
            .arg(key_path)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn remote_reachable(&self, repo_url: &str, key_path: Option<&Path>) -> bool {
        let mut cmd = std::process::Command::new("git");
        cmd.args(["ls-remote", "--heads", repo_url])
            .env("GIT_TERMINAL_PROMPT", "0")
            .env(
                "GIT_SSH_COMMAND",
                match key_path {
                    Some(key) => format!(
                        "ssh -o BatchMode=yes -o ConnectTimeout={} -i {}",
                        self.probe_timeout.as_secs(),
                        key.display()
                    ),
                    None => format!(
                        "ssh -o BatchMode=yes -o ConnectTimeout={}",
                        self.probe_timeout.as_secs()
                    ),
                },
            );
        cmd.status().map(|s| s.success()).unwrap_or(false)
    }
}

struct CachedReport {
    at: Instant,
    report: ReadinessReport,
}

pub struct ReadinessChecker {
    projects: DashMap<String, ProjectConfig>,
    cache: DashMap<String, CachedReport>,
    last_filed: DashMap<String, DateTime<Utc>>,
    base_dir: PathBuf,
    ttl: Duration,
    probe: Box<dyn GitAuthProbe>,
    store: Arc<BeadStore>,
    /// Underlying (non-cached) checks performed; exposed for observability.
    probes: AtomicU64,
}

impl ReadinessChecker {
    pub fn new(base_dir: impl Into<PathBuf>, store: Arc<BeadStore>) -> Self {
        Self::with_probe(
            base_dir,
            store,
            Box::new(CliGitAuthProbe::new(Duration::from_secs(15))),
        )
    }

    pub fn with_probe(
        base_dir: impl Into<PathBuf>,
        store: Arc<BeadStore>,
        probe: Box<dyn GitAuthProbe>,
    ) -> Self {
        Self {
            projects: DashMap::new(),
            cache: DashMap::new(),
            last_filed: DashMap::new(),
            base_dir: base_dir.into(),
            ttl: READINESS_TTL,
            probe,
            store,
            probes: AtomicU64::new(0),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn register_project(&self, config: ProjectConfig) {
        self.cache.remove(&config.id);
        self.projects.insert(config.id.clone(), config);
    }

    pub fn remove_project(&self, project_id: &str) {
        self.projects.remove(project_id);
        self.cache.remove(project_id);
    }

    /// Underlying probes performed so far (cache hits excluded).
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn invalidate(&self, project_id: &str) {
        self.cache.remove(project_id);
    }

    /// Check a project, serving from cache within the TTL.
    pub async fn check(&self, project_id: &str) -> ReadinessReport {
        if let Some(cached) = self.cache.get(project_id) {
            if cached.at.elapsed() < self.ttl {
                return cached.report.clone();
            }
        }
        let report = self.check_uncached(project_id, false).await;
        self.cache.insert(
            project_id.to_string(),
            CachedReport {
                at: Instant::now(),
                report: report.clone(),
            },
        );
        if !report.ready {
            self.file_readiness_bead(project_id, &report).await;
        }
        report
    }

    async fn check_uncached(&self, project_id: &str, healed: bool) -> ReadinessReport {
        self.probes.fetch_add(1, Ordering::Relaxed);

        let config = match self.projects.get(project_id) {
            Some(config) => config.clone(),
            None => {
                return ReadinessReport {
                    ready: false,
                    issues: vec![format!("project {project_id} is not configured")],
                }
            }
        };

        let mut issues = Vec::new();
        self.check_git_auth(&config, &mut issues);

        let beads_path = self.beads_path(&config);
        if !beads_path_present(&beads_path) {
            issues.push(format!("beads path missing: {}", beads_path.display()));
        }

        if issues.is_empty() {
            return ReadinessReport::ready();
        }
        if healed {
            return ReadinessReport {
                ready: false,
                issues,
            };
        }

        // Self-heal pass, at most once per check.
        if self.try_heal(&config, &issues) {
            info!(project = %project_id, "readiness self-heal applied, re-checking");
            self.cache.remove(project_id);
            return Box::pin(self.check_uncached(project_id, true)).await;
        }
        ReadinessReport {
            ready: false,
            issues,
        }
    }

    fn check_git_auth(&self, config: &ProjectConfig, issues: &mut Vec<String>) {
        let repo_url = match config.repo_url.as_deref() {
            Some(url) if !url.is_empty() => url,
            _ => return,
        };
        match config.git_auth {
            GitAuthMode::None => {}
            GitAuthMode::Ssh => {
                let key_path = self.ssh_key_path(&config.id);
                if !repo_url.starts_with("git@") && !repo_url.starts_with("ssh://") {
                    issues.push(format!("repo url is not ssh-shaped: {repo_url}"));
                    return;
                }
                if !self.probe.ensure_keypair(&key_path) {
                    issues.push(format!("ssh keypair unavailable at {}", key_path.display()));
                    return;
                }
                if !self.probe.remote_reachable(repo_url, Some(&key_path)) {
                    issues.push(format!("remote not reachable: {repo_url}"));
                }
            }
            GitAuthMode::Token => {
                let var = config.token_env.as_deref().unwrap_or("");
                if var.is_empty() || std::env::var(var).is_err() {
                    issues.push(format!("git token env {var:?} not resolvable"));
                }
            }
            GitAuthMode::Helper => {
                if !self.probe.remote_reachable(repo_url, None) {
                    issues.push(format!("credential helper cannot reach {repo_url}"));
                }
            }
        }
    }

    fn try_heal(&self, config: &ProjectConfig, issues: &[String]) -> bool {
        let mut healed = false;
        for issue in issues {
            if issue.starts_with("beads path missing") {
                let path = self.beads_path(config);
                if create_dir_0755(&path) {
                    info!(path = %path.display(), "readiness self-heal: created beads path");
                    healed = true;
                } else {
                    warn!(path = %path.display(), "readiness self-heal: mkdir failed");
                }
            }
            // Token issues retry on the recursed check; resolvability can
            // change when the environment was fixed under us.
            if issue.contains("token env") && config.git_auth == GitAuthMode::Token {
                if let Some(var) = config.token_env.as_deref() {
                    if std::env::var(var).is_ok() {
                        healed = true;
                    }
                }
            }
        }
        healed
    }

    async fn file_readiness_bead(&self, project_id: &str, report: &ReadinessReport) {
        // Dedup: no second bead while an unresolved readiness bead exists.
        let existing = self.store.list_by_filter(&BeadFilter {
            project_id: Some(project_id.to_string()),
            tag: Some(READINESS_TAG.to_string()),
            ..Default::default()
        });
        if existing.iter().any(|b| {
            matches!(
                b.status,
                BeadStatus::Open | BeadStatus::InProgress | BeadStatus::Blocked
            )
        }) {
            return;
        }
        // Throttle: at most one per project per four hours.
        if let Some(last) = self.last_filed.get(project_id) {
            if Utc::now() - *last < READINESS_BEAD_THROTTLE {
                return;
            }
        }

        let description = report.issues.join("\n");
        match self
            .store
            .create(
                format!("Readiness check failing for {project_id}"),
                description,
                Priority::P3,
                BeadType::Task,
                project_id,
            )
            .await
        {
            Ok(bead) => {
                let _ = self
                    .store
                    .update(
                        &bead.id,
                        loom_store::store::BeadPatch {
                            tags: Some(vec![
                                READINESS_TAG.to_string(),
                                HUMAN_CONFIG_TAG.to_string(),
                            ]),
                            ..Default::default()
                        },
                    )
                    .await;
                self.last_filed.insert(project_id.to_string(), Utc::now());
                warn!(project = %project_id, bead_id = %bead.id, "readiness bead filed");
            }
            Err(e) => warn!(project = %project_id, error = %e, "failed to file readiness bead"),
        }
    }

    fn beads_path(&self, config: &ProjectConfig) -> PathBuf {
        config
            .beads_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join(&config.id).join("beads"))
    }

    fn ssh_key_path(&self, project_id: &str) -> PathBuf {
        self.base_dir.join(project_id).join(".ssh").join("id_ed25519")
    }
}

/// The beads path is present when it is an `issues.jsonl` file or a
/// directory. Every accepted shape is loadable by the federation reader:
/// a direct JSONL file, a directory holding `issues.jsonl` or `beads/`,
/// and a bare directory, which reads as a valid empty record set.
fn beads_path_present(path: &Path) -> bool {
    if path.is_file() {
        return path.file_name().and_then(|n| n.to_str()) == Some("issues.jsonl");
    }
    path.is_dir()
}

fn create_dir_0755(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    if std::fs::create_dir_all(path).is_err() {
        return false;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
