//! The orchestrator owns every component's lifetime.
//!
//! `initialize` wires the control plane in dependency order: projects from
//! the durable mirror unioned with configuration, beads from the beads
//! worktree, providers probed and activated, agents restored and recovered,
//! the org chart staffed, and finally the per-project executors plus the
//! maintenance ticker and federation sync loops. Shutdown is idempotent and
//! tears workers down in reverse start order. Configuration is snapshotted
//! at construction; `apply_snapshot` swaps it and restarts the workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use loom_agents::manager::AgentManager;
use loom_agents::persona::{default_persona, role_for_position, REQUIRED_POSITIONS};
use loom_agents::recovery::recover_on_boot;
use loom_bus::{EventBus, EventFilter};
use loom_core::cache::CacheDb;
use loom_core::config::{Config, ProjectConfig};
use loom_core::context::ContextStore;
use loom_core::filelock::FileLockManager;
use loom_core::types::{AgentStatus, Bead, Event};
use loom_executor::executor::{ExecutorConfig, TaskExecutor};
use loom_executor::readiness::ReadinessChecker;
use loom_executor::router::ActionRouter;
use loom_executor::shell::{ProcessShellRunner, ShellRunner};
use loom_executor::workflow::WorkflowEngine;
use loom_providers::health::HealthProber;
use loom_providers::registry::ProviderRegistry;
use loom_store::decision::DecisionManager;
use loom_store::federation::{read_bead_records, GitRunner, RealGitRunner, SyncCoordinator};
use loom_store::store::BeadStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The control plane's own work lives under this project.
pub const SELF_PROJECT: &str = "loom";

/// Idle conversation contexts are dropped after this long.
const CONTEXT_TTL: Duration = Duration::from_secs(24 * 3600);

struct Workers {
    shutdown_tx: watch::Sender<bool>,
    /// In start order; joined in reverse on shutdown.
    handles: Vec<JoinHandle<()>>,
}

pub struct Loom {
    config: Config,
    cache: Arc<CacheDb>,
    bus: EventBus,
    store: Arc<BeadStore>,
    decisions: Arc<DecisionManager>,
    locks: Arc<FileLockManager>,
    contexts: Arc<ContextStore>,
    agents: Arc<AgentManager>,
    registry: Arc<ProviderRegistry>,
    readiness: Arc<ReadinessChecker>,
    router: Arc<ActionRouter>,
    workflow: Arc<WorkflowEngine>,
    workers: Mutex<Option<Workers>>,
}

impl Loom {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        std::fs::create_dir_all(&config.general.base_dir)
            .with_context(|| format!("creating {}", config.general.base_dir.display()))?;
        if let Some(parent) = config.general.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let cache = Arc::new(
            CacheDb::new(&config.general.db_path)
                .await
                .context("opening cache database")?,
        );
        let bus = EventBus::new();
        let store = Arc::new(BeadStore::new(Arc::clone(&cache), bus.clone()));
        let decisions = Arc::new(DecisionManager::new(Arc::clone(&store), bus.clone()));
        let locks = Arc::new(FileLockManager::new(config.timeouts.file_lock()));
        let contexts = Arc::new(ContextStore::new(config.dispatch.token_budget, CONTEXT_TTL));
        let agents = Arc::new(AgentManager::new(Arc::clone(&cache), bus.clone()));
        let registry = Arc::new(ProviderRegistry::new(
            Arc::clone(&cache),
            bus.clone(),
            config.timeouts.chat(),
        ));
        let readiness = Arc::new(
            ReadinessChecker::new(&config.general.base_dir, Arc::clone(&store))
                .with_ttl(config.timeouts.readiness_ttl()),
        );
        let workflow = Arc::new(WorkflowEngine::new());
        let shell: Arc<dyn ShellRunner> = Arc::new(ProcessShellRunner::new(Arc::clone(&cache)));
        let router = Arc::new(ActionRouter::new(
            Arc::clone(&store),
            Arc::clone(&decisions),
            Arc::clone(&locks),
            shell,
            Arc::clone(&workflow),
            Arc::clone(&contexts),
        ));

        Ok(Self {
            config,
            cache,
            bus,
            store,
            decisions,
            locks,
            contexts,
            agents,
            registry,
            readiness,
            router,
            workflow,
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<BeadStore> {
        &self.store
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn decisions(&self) -> &Arc<DecisionManager> {
        &self.decisions
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflow
    }

    /// Bring the control plane up. Safe to call again after `shutdown`.
    pub async fn initialize(&self) -> Result<()> {
        // 1. projects: durable store ∪ configuration ∪ self-project
        let projects = self.load_projects().await?;
        info!(count = projects.len(), "projects loaded");

        // 2. workspaces and beads
        self.store.load_from_cache().await?;
        for project in &projects {
            self.ensure_workspace(project);
            let report = self.readiness.check(&project.id).await;
            if !report.ready {
                warn!(project = %project.id, issues = ?report.issues, "project not ready");
            }
            self.load_project_beads(project).await?;
        }

        // 3. providers
        let restored = self.registry.load_from_cache().await?;
        let usable = HealthProber::new(Arc::clone(&self.registry))
            .with_timeout(self.config.timeouts.probe())
            .probe_all()
            .await;
        info!(restored, usable = usable.len(), "providers probed");

        // 4. agents and crash recovery
        self.restore_agents().await?;
        let recovery = recover_on_boot(&self.agents, &self.store).await;
        info!(
            agents_reset = recovery.agents_reset,
            beads_reset = recovery.beads_reset,
            "boot recovery complete"
        );

        // 5. org chart
        for project in &projects {
            self.fill_org_chart(&project.id).await?;
        }

        // 6. wake paused agents where providers allow
        self.attach_providers_to_paused().await;

        // 7. workers
        self.start_workers(&projects).await;
        info!("initialization complete");
        Ok(())
    }

    /// Stop all workers. Idempotent; joins in reverse start order.
    pub async fn shutdown(&self) {
        let Some(workers) = self.workers.lock().await.take() else {
            return;
        };
        let _ = workers.shutdown_tx.send(true);
        for handle in workers.handles.into_iter().rev() {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker did not shut down cleanly");
            }
        }
        info!("shutdown complete");
    }

    /// Swap the configuration snapshot: stops the workers, installs the new
    /// config, and re-runs initialization.
    pub async fn apply_snapshot(&mut self, config: Config) -> Result<()> {
        config.validate().context("invalid configuration")?;
        self.shutdown().await;
        self.config = config;
        self.initialize().await
    }

    // -----------------------------------------------------------------------
    // Initialization steps
    // -----------------------------------------------------------------------

    async fn load_projects(&self) -> Result<Vec<ProjectConfig>> {
        let mut projects: HashMap<String, ProjectConfig> = HashMap::new();
        for (id, config_json) in self.cache.list_projects().await? {
            match serde_json::from_str::<ProjectConfig>(&config_json) {
                Ok(project) => {
                    projects.insert(id, project);
                }
                Err(e) => warn!(project = %id, error = %e, "skipping unparseable project record"),
            }
        }
        // configuration wins over the durable mirror
        for project in &self.config.projects {
            projects.insert(project.id.clone(), project.clone());
        }
        projects
            .entry(SELF_PROJECT.to_string())
            .or_insert_with(|| ProjectConfig {
                id: SELF_PROJECT.to_string(),
                ..Default::default()
            });

        for project in projects.values() {
            let json = serde_json::to_string(project)?;
            self.cache.upsert_project(&project.id, &json).await?;
            self.readiness.register_project(project.clone());
        }

        let mut list: Vec<ProjectConfig> = projects.into_values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    fn ensure_workspace(&self, project: &ProjectConfig) {
        let root = self.config.general.base_dir.join(&project.id);
        if let Err(e) = std::fs::create_dir_all(root.join("main")) {
            warn!(project = %project.id, error = %e, "failed to create main worktree dir");
        }
        if let Err(e) = std::fs::create_dir_all(self.beads_path(project)) {
            warn!(project = %project.id, error = %e, "failed to create beads dir");
        }

        let Some(url) = project.repo_url.as_deref().filter(|u| !u.is_empty()) else {
            return;
        };
        let git = RealGitRunner;
        let main = root.join("main");
        let result = if main.join(".git").exists() {
            git.run_git(&main, &["pull", "--ff-only"])
        } else {
            git.run_git(&root, &["clone", url, "main"])
        };
        match result {
            Ok(output) if output.success => {
                debug!(project = %project.id, "workspace synchronized")
            }
            Ok(output) => {
                warn!(project = %project.id, stderr = %output.stderr, "workspace sync failed")
            }
            Err(e) => warn!(project = %project.id, error = %e, "workspace sync failed"),
        }
    }

    /// Load beads for one project, deduplicated by ID with the beads
    /// worktree winning over the cache mirror.
    async fn load_project_beads(&self, project: &ProjectConfig) -> Result<()> {
        let beads_path = self.beads_path(project);
        let records = match read_bead_records(&beads_path) {
            Ok(records) => records,
            Err(e) => {
                debug!(project = %project.id, error = %e, "no bead records on disk");
                return Ok(());
            }
        };
        if records.is_empty() {
            return Ok(());
        }

        let mut merged: HashMap<String, Bead> = self
            .store
            .project_snapshot(&project.id)
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect();
        for record in records {
            merged.insert(record.id.clone(), record);
        }
        let count = self
            .store
            .replace_project(&project.id, merged.into_values().collect())
            .await?;
        info!(project = %project.id, count, "beads loaded from worktree");
        Ok(())
    }

    async fn restore_agents(&self) -> Result<()> {
        let loaded = self.agents.load_from_cache().await?;
        for agent in self.agents.list() {
            let provider = agent
                .provider_id
                .filter(|id| self.provider_usable(id));
            self.agents.restore(&agent.id, provider).await?;
        }
        info!(loaded, "agents restored");
        Ok(())
    }

    async fn fill_org_chart(&self, project_id: &str) -> Result<()> {
        for position in REQUIRED_POSITIONS {
            if !self.agents.get_by_position(project_id, position).is_empty() {
                continue;
            }
            self.agents
                .create_for_position(
                    position,
                    default_persona(position),
                    project_id,
                    role_for_position(position),
                )
                .await?;
        }
        Ok(())
    }

    async fn attach_providers_to_paused(&self) {
        let active = self.registry.list_active();
        if active.is_empty() {
            return;
        }
        let mut next = 0usize;
        for agent in self.agents.list() {
            if agent.status != AgentStatus::Paused {
                continue;
            }
            if agent
                .provider_id
                .as_deref()
                .is_some_and(|id| self.provider_usable(id))
            {
                continue;
            }
            let provider = &active[next % active.len()];
            next += 1;
            if let Err(e) = self.agents.attach_provider(&agent.id, &provider.id).await {
                warn!(agent = %agent.id, error = %e, "provider attach failed");
            }
        }
    }

    fn provider_usable(&self, provider_id: &str) -> bool {
        self.registry
            .get(provider_id)
            .map(|p| p.status.is_usable())
            .unwrap_or(false)
    }

    fn beads_path(&self, project: &ProjectConfig) -> std::path::PathBuf {
        project.beads_path.clone().unwrap_or_else(|| {
            self.config
                .general
                .base_dir
                .join(&project.id)
                .join("beads")
        })
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    async fn start_workers(&self, projects: &[ProjectConfig]) {
        // replace any previous worker set
        self.shutdown().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for project in projects {
            let executor = Arc::new(TaskExecutor::new(
                project.id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.agents),
                Arc::clone(&self.registry),
                Arc::clone(&self.router),
                Arc::clone(&self.readiness),
                Arc::clone(&self.contexts),
                Arc::clone(&self.locks),
                self.bus.clone(),
                ExecutorConfig {
                    tick: Duration::from_secs(self.config.dispatch.tick_secs),
                    max_iterations: self.config.dispatch.max_iterations,
                    max_concurrent: self.config.agents.max_concurrent,
                    base_dir: self.config.general.base_dir.clone(),
                    per_agent_worktrees: project.per_agent_worktrees,
                },
            ));
            handles.push(tokio::spawn(executor.run(shutdown_rx.clone())));
        }

        // federation sync per project with a remote
        for project in projects {
            if project.repo_url.as_deref().map_or(true, str::is_empty) {
                continue;
            }
            let coordinator = Arc::new(SyncCoordinator::new(
                project.id.clone(),
                self.beads_path(project),
                self.config.federation.sync_branch.clone(),
                Arc::clone(&self.store),
                self.bus.clone(),
                Duration::from_secs(self.config.federation.sync_secs),
            ));
            handles.push(tokio::spawn(Self::run_sync_loop(
                coordinator,
                shutdown_rx.clone(),
            )));
        }

        let maintenance = Arc::new(crate::maintenance::Maintenance::new(
            Arc::clone(&self.locks),
            Arc::clone(&self.agents),
            Arc::clone(&self.store),
            Arc::clone(&self.contexts),
            projects
                .iter()
                .map(|p| (p.id.clone(), self.beads_path(p)))
                .collect(),
            Duration::from_secs(self.config.agents.stuck_threshold_secs),
            self.config.agents.retire_after_days,
            Duration::from_secs(self.config.dispatch.maintenance_secs),
        ));
        handles.push(tokio::spawn(maintenance.run(shutdown_rx.clone())));

        handles.push(tokio::spawn(Self::run_activation_listener(
            self.bus.clone(),
            Arc::clone(&self.agents),
            Arc::clone(&self.registry),
            shutdown_rx,
        )));

        *self.workers.lock().await = Some(Workers {
            shutdown_tx,
            handles,
        });
    }

    async fn run_sync_loop(coordinator: Arc<SyncCoordinator>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(coordinator.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = coordinator.sync_once().await {
                warn!(error = %e, "federation sync failed");
            }
        }
    }

    /// Attaches newly activated providers to paused agents, so capacity
    /// recovers without waiting for a restart.
    async fn run_activation_listener(
        bus: EventBus,
        agents: Arc<AgentManager>,
        registry: Arc<ProviderRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let filter: EventFilter =
            Arc::new(|event: &Event| event.event_type == "provider_activated");
        let rx = bus.subscribe("orchestrator-activation", Some(filter));
        loop {
            let event = tokio::select! {
                result = rx.recv_async() => match result {
                    Ok(event) => event,
                    Err(_) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(provider_id) = event.data.get("provider_id") else {
                continue;
            };
            if !registry
                .get(provider_id)
                .map(|p| p.status.is_usable())
                .unwrap_or(false)
            {
                continue;
            }
            for agent in agents.list() {
                if agent.status != AgentStatus::Paused {
                    continue;
                }
                if let Err(e) = agents.attach_provider(&agent.id, provider_id).await {
                    warn!(agent = %agent.id, error = %e, "provider attach failed");
                }
            }
        }
        bus.unsubscribe("orchestrator-activation");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::types::{BeadStatus, BeadType, Priority};

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.general.base_dir = dir.join("base");
        config.general.db_path = dir.join("loom.db");
        config.projects.push(ProjectConfig {
            id: "p".into(),
            ..Default::default()
        });
        config
    }

    #[tokio::test]
    async fn initialize_recovers_zombie_beads_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        // first life: a bead is claimed by an ephemeral worker, then we crash
        {
            let loom = Loom::new(config.clone()).await.unwrap();
            let bead = loom
                .store()
                .create("task", "desc", Priority::P2, BeadType::Task, "p")
                .await
                .unwrap();
            loom.store().claim(&bead.id, "exec-dead").await.unwrap();
            // no shutdown: simulate a crash
        }

        let loom = Loom::new(config).await.unwrap();
        loom.initialize().await.unwrap();

        let bead = loom.store().get("p-1").unwrap();
        assert_eq!(bead.status, BeadStatus::Open);
        assert!(bead.assigned_to.is_empty());
        loom.shutdown().await;
    }

    #[tokio::test]
    async fn initialize_staffs_required_positions_once() {
        let dir = tempfile::tempdir().unwrap();
        let loom = Loom::new(config_in(dir.path())).await.unwrap();

        loom.initialize().await.unwrap();
        loom.shutdown().await;
        loom.initialize().await.unwrap();

        for position in REQUIRED_POSITIONS {
            let staffed = loom.agents().get_by_position("p", position);
            assert_eq!(staffed.len(), 1, "position {position}");
            assert_eq!(staffed[0].status, AgentStatus::Paused);
        }
        loom.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let loom = Loom::new(config_in(dir.path())).await.unwrap();
        loom.initialize().await.unwrap();
        loom.shutdown().await;
        loom.shutdown().await;
    }

    #[tokio::test]
    async fn self_project_is_always_present() {
        let dir = tempfile::tempdir().unwrap();
        let loom = Loom::new(config_in(dir.path())).await.unwrap();
        loom.initialize().await.unwrap();

        let projects = loom.load_projects().await.unwrap();
        assert!(projects.iter().any(|p| p.id == SELF_PROJECT));
        loom.shutdown().await;
    }
}
