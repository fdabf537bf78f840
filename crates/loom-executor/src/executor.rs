//! The per-project execution loop.
//!
//! One executor runs per project. Each tick (or wake signal) it gates on
//! readiness, claims ready beads under an ephemeral exec ID, and drives the
//! claim through prompt → completion → routed actions until a `done` fires,
//! the bead closes, or the iteration cap trips. The cap releases the bead
//! open and unassigned so another pass can pick it up with the accumulated
//! conversation intact.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use loom_agents::manager::{AgentError, AgentManager};
use loom_agents::recovery::EPHEMERAL_PREFIX;
use loom_bus::{EventBus, EventFilter};
use loom_core::context::ContextStore;
use loom_core::filelock::FileLockManager;
use loom_core::types::{Agent, AgentStatus, Bead, BeadStatus, ChatMessage, Event, Persona};
use loom_providers::protocol::ChatRequest;
use loom_providers::registry::ProviderRegistry;
use loom_store::store::{BeadPatch, BeadStore, StoreError};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::actions::decode_envelope;
use crate::readiness::ReadinessChecker;
use crate::router::{ActionRouter, RouteScope};

/// Envelope contract injected into every system prompt.
const ACTION_SCHEMA: &str = r#"Respond with a JSON envelope: {"actions": [{"type": "...", "payload": {...}}, ...]}.
Available action types:
  bead_create {title, description?, priority?}   file_read {path}
  bead_close {bead_id, reason?}                  file_write {path, content}
  bead_update {bead_id, title?, description?, priority?}
  add_dependency {from, to}                      apply_patch {path, patch}
  escalate {bead_id, reason}                     file_list {path?}
  git_status {}  git_commit {message}            file_search {pattern, path?}
  git_push {}  git_pull {}  git_branch {name}    git_pr {title, body?}
  command {command, working_dir?, timeout_seconds?}
  build_env {}
  workflow_advance {condition: success|failure|approved|rejected|timeout|escalated}
  done {reason?}
Emit done when the task is complete. Results of each action arrive as system messages."#;

/// Events that should wake a project's executor before its next tick.
const WAKE_EVENTS: &[&str] = &[
    "bead_created",
    "bead_unblocked",
    "bead_released",
    "decision_made",
];

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub tick: Duration,
    pub max_iterations: u32,
    /// Workers driven in parallel within this project's executor group.
    pub max_concurrent: u32,
    pub base_dir: PathBuf,
    pub per_agent_worktrees: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            max_iterations: 100,
            max_concurrent: 4,
            base_dir: PathBuf::from(".loom"),
            per_agent_worktrees: false,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

pub struct TaskExecutor {
    project_id: String,
    store: Arc<BeadStore>,
    agents: Arc<AgentManager>,
    registry: Arc<ProviderRegistry>,
    router: Arc<ActionRouter>,
    readiness: Arc<ReadinessChecker>,
    contexts: Arc<ContextStore>,
    locks: Arc<FileLockManager>,
    bus: EventBus,
    config: ExecutorConfig,
    /// Bounds concurrent bead workers at `config.max_concurrent`.
    slots: Arc<Semaphore>,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: impl Into<String>,
        store: Arc<BeadStore>,
        agents: Arc<AgentManager>,
        registry: Arc<ProviderRegistry>,
        router: Arc<ActionRouter>,
        readiness: Arc<ReadinessChecker>,
        contexts: Arc<ContextStore>,
        locks: Arc<FileLockManager>,
        bus: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1) as usize));
        Self {
            project_id: project_id.into(),
            store,
            agents,
            registry,
            router,
            readiness,
            contexts,
            locks,
            bus,
            config,
            slots,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Run until the shutdown channel flips to `true`. Ticks on the
    /// configured interval and on wake events for this project.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let filter: EventFilter = {
            let project_id = self.project_id.clone();
            Arc::new(move |event: &Event| {
                event.project_id.as_deref() == Some(project_id.as_str())
                    && WAKE_EVENTS.contains(&event.event_type.as_str())
            })
        };
        let wake = self
            .bus
            .subscribe(format!("executor-{}", self.project_id), Some(filter));

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(project = %self.project_id, "executor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                result = wake.recv_async() => {
                    if result.is_err() {
                        // bus gone; fall back to pure ticking
                        ticker.tick().await;
                    }
                }
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.run_tick().await;
        }
        self.bus.unsubscribe(&format!("executor-{}", self.project_id));
        info!(project = %self.project_id, "executor stopped");
    }

    /// One dispatch pass: readiness gate, then claim and drive each ready
    /// bead while idle agents remain. Beads run in parallel, bounded by
    /// `max_concurrent` worker slots; the pass returns once every spawned
    /// worker has finished.
    pub async fn run_tick(self: &Arc<Self>) {
        let report = self.readiness.check(&self.project_id).await;
        if !report.ready {
            debug!(
                project = %self.project_id,
                issues = ?report.issues,
                "project not ready, skipping tick"
            );
            return;
        }
        let mut workers = JoinSet::new();
        for bead in self.store.get_ready(&self.project_id) {
            let permit = match Arc::clone(&self.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = Arc::clone(self);
            workers.spawn(async move {
                executor.execute_bead(&bead).await;
                drop(permit);
            });
        }
        while workers.join_next().await.is_some() {}
    }

    async fn execute_bead(&self, bead: &Bead) {
        if self.agents.get_idle(&self.project_id).is_empty() {
            debug!(project = %self.project_id, "no idle agents");
            return;
        }

        let exec_id = format!("{EPHEMERAL_PREFIX}{}", uuid::Uuid::new_v4());
        match self.store.claim(&bead.id, &exec_id).await {
            Ok(_) => {}
            Err(StoreError::AlreadyClaimed { .. }) => {
                debug!(bead_id = %bead.id, "already claimed, skipping");
                return;
            }
            Err(e) => {
                warn!(bead_id = %bead.id, error = %e, "claim failed");
                return;
            }
        }

        // Concurrent workers race for the same idle pool; losing a candidate
        // to another bead is normal, so keep trying until one accepts.
        let mut agent = None;
        for candidate in self.agents.get_idle(&self.project_id) {
            match self.agents.assign_bead(&candidate.id, &bead.id).await {
                Ok(assigned) => {
                    agent = Some(assigned);
                    break;
                }
                Err(AgentError::InvalidTransition { .. }) => continue,
                Err(e) => {
                    warn!(agent = %candidate.id, bead_id = %bead.id, error = %e, "assignment failed");
                    break;
                }
            }
        }
        let Some(agent) = agent else {
            self.release_quietly(&bead.id).await;
            return;
        };

        if !self.provider_usable(&agent) {
            warn!(
                agent = %agent.id,
                bead_id = %bead.id,
                "agent has no usable provider, releasing bead"
            );
            self.release_quietly(&bead.id).await;
            if let Err(e) = self.agents.stop(&agent.id).await {
                warn!(agent = %agent.id, error = %e, "failed to pause agent");
            }
            return;
        }

        let scope = RouteScope {
            agent_id: agent.id.clone(),
            bead_id: bead.id.clone(),
            project_id: self.project_id.clone(),
            worktree: self.worktree_for(&bead.id).await,
        };
        let completed = self.drive(&agent, bead, &scope).await;

        if !completed {
            info!(
                bead_id = %bead.id,
                max_iterations = self.config.max_iterations,
                "iteration cap reached, releasing bead"
            );
            self.release_quietly(&bead.id).await;
        }

        // Stray locks from interrupted writes, under either identity.
        self.locks.release_agent_locks(&agent.id);
        self.locks.release_agent_locks(&exec_id);

        if let Err(e) = self.agents.update_status(&agent.id, AgentStatus::Idle).await {
            warn!(agent = %agent.id, error = %e, "failed to idle agent");
        }
        if let Err(e) = self.agents.touch(&agent.id).await {
            warn!(agent = %agent.id, error = %e, "failed to touch agent");
        }
    }

    /// The prompt → completion → route loop. Returns `true` when the bead
    /// finished (done or closed), `false` when the cap tripped or the
    /// provider failed.
    async fn drive(&self, agent: &Agent, bead: &Bead, scope: &RouteScope) -> bool {
        let provider_id = match &agent.provider_id {
            Some(id) => id.clone(),
            None => return false,
        };

        for iteration in 0..self.config.max_iterations {
            let request = ChatRequest::new(self.compose(&agent.persona, bead));
            let response = match self.registry.chat(&provider_id, &request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        bead_id = %bead.id,
                        provider = %provider_id,
                        iteration,
                        error = %e,
                        "completion failed"
                    );
                    return false;
                }
            };
            self.contexts
                .append(&bead.id, ChatMessage::assistant(&response.content));

            let report = match decode_envelope(&response.content) {
                Ok(decoded) => self.router.route(scope, decoded).await,
                Err(e) => self.router.route_envelope_failure(scope, &e),
            };

            if report.bead_closed {
                return true;
            }
            if report.done {
                // done without an explicit close closes the bead here
                match self
                    .store
                    .update(&bead.id, BeadPatch::status(BeadStatus::Closed))
                    .await
                {
                    Ok(_) => return true,
                    Err(e) => {
                        warn!(bead_id = %bead.id, error = %e, "close after done failed");
                        return false;
                    }
                }
            }
        }
        false
    }

    fn compose(&self, persona: &Persona, bead: &Bead) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.contexts.messages(&bead.id).len() + 2);
        messages.push(ChatMessage::system(format!(
            "{}\n\n{}",
            persona.body, ACTION_SCHEMA
        )));
        messages.extend(self.contexts.messages(&bead.id));
        messages.push(ChatMessage::user(format!(
            "{}\n\n{}",
            bead.title, bead.description
        )));
        messages
    }

    fn provider_usable(&self, agent: &Agent) -> bool {
        agent
            .provider_id
            .as_deref()
            .and_then(|id| self.registry.get(id).ok())
            .map(|p| p.status.is_usable())
            .unwrap_or(false)
    }

    async fn worktree_for(&self, bead_id: &str) -> PathBuf {
        if self.config.per_agent_worktrees {
            let path = self
                .config
                .base_dir
                .join(&self.project_id)
                .join("agents")
                .join(bead_id);
            if let Err(e) = tokio::fs::create_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "failed to create bead worktree");
            }
            path
        } else {
            self.config.base_dir.join(&self.project_id).join("main")
        }
    }

    async fn release_quietly(&self, bead_id: &str) {
        if let Err(e) = self.store.release(bead_id).await {
            warn!(bead_id = %bead_id, error = %e, "release failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{RecordingShellRunner, ShellRunner};
    use crate::workflow::WorkflowEngine;
    use loom_agents::persona::default_persona;
    use loom_core::cache::CacheDb;
    use loom_core::config::ProjectConfig;
    use loom_core::types::{
        BeadType, MessageRole, Priority, Provider, ProviderStatus, ProviderType,
    };
    use loom_providers::protocol::MockTransport;
    use loom_store::decision::DecisionManager;

    struct Fixture {
        executor: Arc<TaskExecutor>,
        store: Arc<BeadStore>,
        agents: Arc<AgentManager>,
        transport: Arc<MockTransport>,
        locks: Arc<FileLockManager>,
        contexts: Arc<ContextStore>,
        agent_id: String,
        _base: tempfile::TempDir,
    }

    fn mock_provider(id: &str) -> Provider {
        Provider {
            id: id.into(),
            provider_type: ProviderType::Mock,
            endpoint: "mock://local".into(),
            key_ref: None,
            configured_model: "m".into(),
            selected_model: None,
            status: ProviderStatus::Pending,
            last_heartbeat: None,
        }
    }

    async fn fixture(register_project: bool, max_iterations: u32) -> Fixture {
        let cache = Arc::new(CacheDb::new_in_memory().await.unwrap());
        let bus = EventBus::new();
        let store = Arc::new(BeadStore::new(Arc::clone(&cache), bus.clone()));
        let decisions = Arc::new(DecisionManager::new(Arc::clone(&store), bus.clone()));
        let locks = Arc::new(FileLockManager::new(Duration::from_secs(60)));
        let shell = Arc::new(RecordingShellRunner::new());
        let workflow = Arc::new(WorkflowEngine::new());
        let contexts = Arc::new(ContextStore::new(100_000, Duration::from_secs(3600)));
        let transport = Arc::new(MockTransport::new());
        let registry = Arc::new(ProviderRegistry::with_transport(
            Arc::clone(&cache),
            bus.clone(),
            Duration::from_secs(5),
            transport.clone(),
        ));
        let agents = Arc::new(AgentManager::new(Arc::clone(&cache), bus.clone()));
        let base = tempfile::tempdir().unwrap();

        let readiness = Arc::new(ReadinessChecker::new(base.path(), Arc::clone(&store)));
        if register_project {
            readiness.register_project(ProjectConfig {
                id: "p".into(),
                ..Default::default()
            });
        }

        registry.register(mock_provider("mock-1")).await.unwrap();
        registry
            .record_success("mock-1", Duration::from_millis(1))
            .await
            .unwrap();

        let agent = agents
            .create("worker", default_persona("engineer"), "p", "engineer")
            .await
            .unwrap();
        agents.attach_provider(&agent.id, "mock-1").await.unwrap();

        let router = Arc::new(ActionRouter::new(
            Arc::clone(&store),
            decisions,
            Arc::clone(&locks),
            shell as Arc<dyn ShellRunner>,
            workflow,
            Arc::clone(&contexts),
        ));
        let executor = Arc::new(TaskExecutor::new(
            "p",
            Arc::clone(&store),
            Arc::clone(&agents),
            registry,
            router,
            readiness,
            Arc::clone(&contexts),
            Arc::clone(&locks),
            bus,
            ExecutorConfig {
                tick: Duration::from_secs(30),
                max_iterations,
                max_concurrent: 4,
                base_dir: base.path().to_path_buf(),
                per_agent_worktrees: false,
            },
        ));
        Fixture {
            executor,
            store,
            agents,
            transport,
            locks,
            contexts,
            agent_id: agent.id,
            _base: base,
        }
    }

    async fn open_bead(f: &Fixture) -> Bead {
        f.store
            .create("fix the build", "make cargo green", Priority::P2, BeadType::Task, "p")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn done_response_closes_the_bead() {
        let f = fixture(true, 100).await;
        let bead = open_bead(&f).await;
        f.transport
            .push_response(r#"{"actions":[{"type":"done","payload":{"reason":"built"}}]}"#);

        f.executor.run_tick().await;

        assert_eq!(f.store.get(&bead.id).unwrap().status, BeadStatus::Closed);
        let agent = f.agents.get(&f.agent_id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_bead.is_none());

        let calls = f.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].messages[0].role, MessageRole::System);
        assert!(calls[0].messages[0].content.contains("JSON envelope"));
        assert_eq!(
            calls[0].messages.last().unwrap().content,
            "fix the build\n\nmake cargo green"
        );
    }

    #[tokio::test]
    async fn unparseable_responses_loop_to_cap_then_release() {
        let f = fixture(true, 3).await;
        let bead = open_bead(&f).await;
        // with no scripted responses the mock answers "ok", which has no
        // envelope; every iteration becomes a parse failure
        f.locks.acquire("p", "stray.rs", &f.agent_id, &bead.id).unwrap();

        f.executor.run_tick().await;

        let after = f.store.get(&bead.id).unwrap();
        assert_eq!(after.status, BeadStatus::Open);
        assert!(after.assigned_to.is_empty());
        assert_eq!(f.transport.calls().len(), 3);
        assert!(!f.locks.is_locked("p", "stray.rs"));

        // the failures are visible in the conversation for the next claim
        let parse_failures = f
            .contexts
            .messages(&bead.id)
            .iter()
            .filter(|m| m.content.contains("parse_failed"))
            .count();
        assert_eq!(parse_failures, 3);
    }

    #[tokio::test]
    async fn foreign_claim_is_skipped_silently() {
        let f = fixture(true, 100).await;
        let bead = open_bead(&f).await;
        let snapshot = f.store.get(&bead.id).unwrap();
        f.store.claim(&bead.id, "agent-other").await.unwrap();

        f.executor.execute_bead(&snapshot).await;

        assert!(f.transport.calls().is_empty());
        assert_eq!(f.store.get(&bead.id).unwrap().assigned_to, "agent-other");
    }

    #[tokio::test]
    async fn unready_project_skips_the_tick() {
        let f = fixture(false, 100).await;
        let bead = open_bead(&f).await;

        f.executor.run_tick().await;

        assert!(f.transport.calls().is_empty());
        assert_eq!(f.store.get(&bead.id).unwrap().status, BeadStatus::Open);
    }

    #[tokio::test]
    async fn missing_provider_releases_bead_and_pauses_agent() {
        let f = fixture(true, 100).await;
        let bead = open_bead(&f).await;
        f.agents.attach_provider(&f.agent_id, "ghost").await.unwrap();

        f.executor.run_tick().await;

        let after = f.store.get(&bead.id).unwrap();
        assert_eq!(after.status, BeadStatus::Open);
        assert!(after.assigned_to.is_empty());
        assert_eq!(
            f.agents.get(&f.agent_id).unwrap().status,
            AgentStatus::Paused
        );
        assert!(f.transport.calls().is_empty());
    }

    /// Releases each chat only once two calls are simultaneously in flight,
    /// so a passing run proves two beads were driven in parallel.
    struct BarrierTransport {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait::async_trait]
    impl loom_providers::protocol::ChatProtocol for BarrierTransport {
        async fn chat(
            &self,
            provider: &Provider,
            _request: &ChatRequest,
            _timeout: Duration,
        ) -> loom_providers::protocol::Result<loom_providers::protocol::ChatResponse> {
            self.barrier.wait().await;
            Ok(loom_providers::protocol::ChatResponse {
                content: r#"{"actions":[{"type":"done","payload":{"reason":"ok"}}]}"#.into(),
                model: provider.model().to_string(),
                total_tokens: 1,
                latency: Duration::from_millis(1),
            })
        }
    }

    #[tokio::test]
    async fn tick_drives_beads_concurrently_up_to_max_concurrent() {
        let cache = Arc::new(CacheDb::new_in_memory().await.unwrap());
        let bus = EventBus::new();
        let store = Arc::new(BeadStore::new(Arc::clone(&cache), bus.clone()));
        let decisions = Arc::new(DecisionManager::new(Arc::clone(&store), bus.clone()));
        let locks = Arc::new(FileLockManager::new(Duration::from_secs(60)));
        let workflow = Arc::new(WorkflowEngine::new());
        let contexts = Arc::new(ContextStore::new(100_000, Duration::from_secs(3600)));
        let registry = Arc::new(ProviderRegistry::with_transport(
            Arc::clone(&cache),
            bus.clone(),
            Duration::from_secs(5),
            Arc::new(BarrierTransport {
                barrier: tokio::sync::Barrier::new(2),
            }),
        ));
        let agents = Arc::new(AgentManager::new(Arc::clone(&cache), bus.clone()));
        let base = tempfile::tempdir().unwrap();
        let readiness = Arc::new(ReadinessChecker::new(base.path(), Arc::clone(&store)));
        readiness.register_project(ProjectConfig {
            id: "p".into(),
            ..Default::default()
        });

        registry.register(mock_provider("mock-1")).await.unwrap();
        registry
            .record_success("mock-1", Duration::from_millis(1))
            .await
            .unwrap();
        for name in ["w1", "w2"] {
            let agent = agents
                .create(name, default_persona("engineer"), "p", "engineer")
                .await
                .unwrap();
            agents.attach_provider(&agent.id, "mock-1").await.unwrap();
        }

        let router = Arc::new(ActionRouter::new(
            Arc::clone(&store),
            decisions,
            Arc::clone(&locks),
            Arc::new(RecordingShellRunner::new()) as Arc<dyn ShellRunner>,
            workflow,
            Arc::clone(&contexts),
        ));
        let executor = Arc::new(TaskExecutor::new(
            "p",
            Arc::clone(&store),
            agents,
            registry,
            router,
            readiness,
            contexts,
            locks,
            bus,
            ExecutorConfig {
                max_concurrent: 2,
                base_dir: base.path().to_path_buf(),
                ..Default::default()
            },
        ));

        let a = store
            .create("first", "", Priority::P2, BeadType::Task, "p")
            .await
            .unwrap();
        let b = store
            .create("second", "", Priority::P2, BeadType::Task, "p")
            .await
            .unwrap();

        // A sequential pass would park the first chat on the barrier forever.
        tokio::time::timeout(Duration::from_secs(5), executor.run_tick())
            .await
            .expect("tick did not run beads in parallel");

        assert_eq!(store.get(&a.id).unwrap().status, BeadStatus::Closed);
        assert_eq!(store.get(&b.id).unwrap().status, BeadStatus::Closed);
    }

    #[tokio::test]
    async fn explicit_close_action_ends_the_loop() {
        let f = fixture(true, 100).await;
        let bead = open_bead(&f).await;
        f.transport.push_response(format!(
            r#"{{"actions":[{{"type":"bead_close","payload":{{"bead_id":"{}","reason":"done"}}}}]}}"#,
            bead.id
        ));

        f.executor.run_tick().await;

        assert_eq!(f.store.get(&bead.id).unwrap().status, BeadStatus::Closed);
        assert_eq!(f.transport.calls().len(), 1);
    }
}
