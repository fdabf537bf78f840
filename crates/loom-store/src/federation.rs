//! Cross-worktree bead federation.
//!
//! Each project carries a dedicated beads worktree checked out to a sync
//! branch. Bead state lives on disk as JSONL (one record per line) or as a
//! `beads/` directory of per-bead JSON files. A periodic coordinator pulls
//! the worktree, merges remote records into the store, writes local changes
//! back, and commits.
//!
//! Merge policy: per-bead last-writer-wins by the record's `updated_at`;
//! within a bead, `status` only moves forward along
//! open < blocked < in_progress < closed and closed never reopens.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use loom_core::types::{Bead, Event};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::BeadStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("git {op} failed: {stderr}")]
    Git { op: String, stderr: String },
    #[error("bad bead record: {0}")]
    BadRecord(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub type Result<T> = std::result::Result<T, FederationError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// On-disk bead records
// ---------------------------------------------------------------------------

/// Read every bead record under `beads_path`: an `issues.jsonl` file (the
/// path itself, or one directly under it) or a `beads/` directory of
/// one-JSON-file-per-bead. Malformed lines are skipped with a warning,
/// never fatal.
pub fn read_bead_records(beads_path: &Path) -> Result<Vec<Bead>> {
    if beads_path.is_file() {
        return read_jsonl(beads_path);
    }
    let jsonl = beads_path.join("issues.jsonl");
    if jsonl.is_file() {
        return read_jsonl(&jsonl);
    }
    let dir = beads_path.join("beads");
    if dir.is_dir() {
        return read_bead_dir(&dir);
    }
    Ok(Vec::new())
}

fn read_jsonl(path: &Path) -> Result<Vec<Bead>> {
    let raw = fs::read_to_string(path).map_err(|source| FederationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Bead>(line) {
            Ok(bead) => out.push(bead),
            Err(e) => {
                warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping bad bead record");
            }
        }
    }
    Ok(out)
}

fn read_bead_dir(dir: &Path) -> Result<Vec<Bead>> {
    let mut out = Vec::new();
    let entries = fs::read_dir(dir).map_err(|source| FederationError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = fs::read_to_string(&path).map_err(|source| FederationError::Io {
            path: path.clone(),
            source,
        })?;
        match serde_json::from_str::<Bead>(&raw) {
            Ok(bead) => out.push(bead),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping bad bead file");
            }
        }
    }
    Ok(out)
}

/// Write the full record set as JSONL, sorted by ID for stable diffs.
/// `beads_path` may name the JSONL file itself or its parent directory.
pub fn write_bead_records(beads_path: &Path, beads: &[Bead]) -> Result<()> {
    let path = if beads_path.is_file() {
        beads_path.to_path_buf()
    } else {
        fs::create_dir_all(beads_path).map_err(|source| FederationError::Io {
            path: beads_path.to_path_buf(),
            source,
        })?;
        beads_path.join("issues.jsonl")
    };
    let mut sorted: Vec<&Bead> = beads.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let mut out = String::new();
    for bead in sorted {
        out.push_str(&serde_json::to_string(bead)?);
        out.push('\n');
    }
    fs::write(&path, out).map_err(|source| FederationError::Io { path, source })
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge a remote record into a local one. The newer `updated_at` wins
/// field-by-field, except status, which is monotonic and terminal at closed.
pub fn merge_beads(local: &Bead, remote: &Bead) -> Bead {
    let (winner, loser) = if remote.updated_at > local.updated_at {
        (remote, local)
    } else {
        (local, remote)
    };
    let mut merged = winner.clone();

    // Status never moves backwards, whatever the timestamps say.
    if loser.status.merge_rank() > merged.status.merge_rank() {
        merged.status = loser.status;
        // The higher status carries its assignment along.
        if loser.status.is_terminal() {
            merged.assigned_to = loser.assigned_to.clone();
        }
    }

    // Edge lists union; a bead seen with an edge anywhere keeps it.
    for other in &loser.blocked_by {
        if !merged.blocked_by.contains(other) {
            merged.blocked_by.push(other.clone());
        }
    }
    for other in &loser.blocks {
        if !merged.blocks.contains(other) {
            merged.blocks.push(other.clone());
        }
    }

    merged.created_at = local.created_at.min(remote.created_at);
    merged.updated_at = local.updated_at.max(remote.updated_at);
    merged
}

/// Merge two full record sets keyed by ID.
pub fn merge_record_sets(local: Vec<Bead>, remote: Vec<Bead>) -> Vec<Bead> {
    let mut by_id: std::collections::HashMap<String, Bead> =
        local.into_iter().map(|b| (b.id.clone(), b)).collect();
    for bead in remote {
        match by_id.remove(&bead.id) {
            Some(existing) => {
                let merged = merge_beads(&existing, &bead);
                by_id.insert(merged.id.clone(), merged);
            }
            None => {
                by_id.insert(bead.id.clone(), bead);
            }
        }
    }
    by_id.into_values().collect()
}

// ---------------------------------------------------------------------------
// SyncCoordinator
// ---------------------------------------------------------------------------

/// Drives one project's periodic beads-worktree reconciliation.
pub struct SyncCoordinator {
    project_id: String,
    /// The beads worktree directory, checked out to the sync branch.
    worktree: PathBuf,
    sync_branch: String,
    store: Arc<BeadStore>,
    git: Box<dyn GitRunner>,
    bus: loom_bus::EventBus,
    interval: Duration,
}

impl SyncCoordinator {
    pub fn new(
        project_id: impl Into<String>,
        worktree: impl Into<PathBuf>,
        sync_branch: impl Into<String>,
        store: Arc<BeadStore>,
        bus: loom_bus::EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            worktree: worktree.into(),
            sync_branch: sync_branch.into(),
            store,
            git: Box::new(RealGitRunner),
            bus,
            interval,
        }
    }

    pub fn with_git_runner(mut self, git: Box<dyn GitRunner>) -> Self {
        self.git = git;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One reconciliation pass: pull, merge remote into the store, write
    /// the merged set back, commit and push when anything changed.
    pub async fn sync_once(&self) -> Result<usize> {
        self.git_step("pull", &["pull", "--ff-only", "origin", &self.sync_branch])?;

        let remote = read_bead_records(&self.worktree)?;
        let local = self.store.project_snapshot(&self.project_id);
        let merged = merge_record_sets(local, remote);
        let count = merged.len();

        self.store
            .replace_project(&self.project_id, merged.clone())
            .await?;
        write_bead_records(&self.worktree, &merged)?;

        if self.has_local_changes()? {
            self.git_step("add", &["add", "-A"])?;
            self.git_step(
                "commit",
                &["commit", "-m", &format!("loom: sync {} beads", count)],
            )?;
            self.git_step("push", &["push", "origin", &self.sync_branch])?;
            info!(project = %self.project_id, beads = count, "federation sync committed");
        } else {
            debug!(project = %self.project_id, beads = count, "federation sync clean");
        }

        self.bus.publish(
            Event::new("federation_synced", "sync_coordinator")
                .with_project(&self.project_id)
                .with_data("beads", count.to_string()),
        );
        Ok(count)
    }

    fn has_local_changes(&self) -> Result<bool> {
        let out = self.git_step("status", &["status", "--porcelain"])?;
        Ok(!out.stdout.trim().is_empty())
    }

    fn git_step(&self, op: &str, args: &[&str]) -> Result<GitOutput> {
        let out = self
            .git
            .run_git(&self.worktree, args)
            .map_err(|stderr| FederationError::Git {
                op: op.to_string(),
                stderr,
            })?;
        if !out.success {
            return Err(FederationError::Git {
                op: op.to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
