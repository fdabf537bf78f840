//! Background maintenance ticker.
//!
//! Every interval (default 60s) it cleans expired file locks, resets stuck
//! agents, refreshes each project's bead records from its worktree, sweeps
//! idle conversation contexts, and retires persona agents idle past the
//! retirement window. Required org-chart positions are never retired.
//! Federation commits run on their own coordinator loops, not here; the
//! refresh pass covers local-only projects that have no sync loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loom_agents::manager::AgentManager;
use loom_agents::persona::is_required_position;
use loom_core::context::ContextStore;
use loom_core::filelock::FileLockManager;
use loom_core::types::{AgentStatus, BeadStatus};
use loom_store::federation::{merge_record_sets, read_bead_records};
use loom_store::store::BeadStore;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_locks: usize,
    pub stuck_agents: usize,
    pub refreshed_beads: usize,
    pub retired_agents: usize,
    pub swept_contexts: usize,
}

pub struct Maintenance {
    locks: Arc<FileLockManager>,
    agents: Arc<AgentManager>,
    store: Arc<BeadStore>,
    contexts: Arc<ContextStore>,
    /// (project ID, beads path) pairs to refresh each pass.
    projects: Vec<(String, PathBuf)>,
    stuck_threshold: Duration,
    retire_after_days: u32,
    interval: Duration,
}

impl Maintenance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locks: Arc<FileLockManager>,
        agents: Arc<AgentManager>,
        store: Arc<BeadStore>,
        contexts: Arc<ContextStore>,
        projects: Vec<(String, PathBuf)>,
        stuck_threshold: Duration,
        retire_after_days: u32,
        interval: Duration,
    ) -> Self {
        Self {
            locks,
            agents,
            store,
            contexts,
            projects,
            stuck_threshold,
            retire_after_days,
            interval,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // skip the immediate first tick
        ticker.tick().await;
        info!(interval = ?self.interval, "maintenance ticker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_once().await;
            if report != MaintenanceReport::default() {
                info!(
                    expired_locks = report.expired_locks,
                    stuck_agents = report.stuck_agents,
                    refreshed_beads = report.refreshed_beads,
                    retired_agents = report.retired_agents,
                    swept_contexts = report.swept_contexts,
                    "maintenance pass"
                );
            }
        }
        info!("maintenance ticker stopped");
    }

    pub async fn run_once(&self) -> MaintenanceReport {
        let expired_locks = self.locks.clean_expired();

        let store = Arc::clone(&self.store);
        let stuck_agents = match self
            .agents
            .reset_stuck_agents(self.stuck_threshold, move |bead_id| {
                store
                    .get(bead_id)
                    .map(|b| b.status != BeadStatus::Closed)
                    .unwrap_or(false)
            })
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "stuck-agent reset failed");
                0
            }
        };

        let refreshed_beads = self.refresh_project_beads().await;
        let swept_contexts = self.contexts.sweep_expired();
        let retired_agents = self.retire_idle_agents().await;

        MaintenanceReport {
            expired_locks,
            stuck_agents,
            refreshed_beads,
            retired_agents,
            swept_contexts,
        }
    }

    /// Re-read each project's bead records from its worktree and merge them
    /// into the store, so edits landing outside a sync loop still arrive.
    async fn refresh_project_beads(&self) -> usize {
        let mut refreshed = 0;
        for (project_id, beads_path) in &self.projects {
            let records = match read_bead_records(beads_path) {
                Ok(records) => records,
                Err(e) => {
                    warn!(project = %project_id, error = %e, "bead refresh read failed");
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }
            let count = records.len();
            let merged = merge_record_sets(self.store.project_snapshot(project_id), records);
            match self.store.replace_project(project_id, merged).await {
                Ok(_) => refreshed += count,
                Err(e) => warn!(project = %project_id, error = %e, "bead refresh merge failed"),
            }
        }
        refreshed
    }

    /// Retire persona agents idle past the window. Agents staffing required
    /// org-chart positions are exempt.
    async fn retire_idle_agents(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retire_after_days));
        let mut retired = 0;
        for agent in self.agents.list() {
            if agent.status == AgentStatus::Working || agent.status == AgentStatus::Deciding {
                continue;
            }
            if agent.last_active >= cutoff {
                continue;
            }
            if agent
                .org_position
                .as_deref()
                .is_some_and(is_required_position)
            {
                continue;
            }
            match self.agents.retire(&agent.id).await {
                Ok(()) => {
                    info!(agent = %agent.id, "retired idle agent");
                    retired += 1;
                }
                Err(e) => warn!(agent = %agent.id, error = %e, "retire failed"),
            }
        }
        retired
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
