//! Dispatches decoded actions to their owning subsystems.
//!
//! Every action produces exactly one [`ActionOutcome`]; failures become
//! `error` or `parse_failed` outcomes rather than aborting the batch. Each
//! outcome is appended to the bead's conversation as a system message with
//! a stable schema so the agent sees what happened on the next turn.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use loom_core::context::ContextStore;
use loom_core::filelock::FileLockManager;
use loom_core::types::{BeadStatus, BeadType, ChatMessage, DependencyKind};
use loom_store::decision::DecisionManager;
use loom_store::store::{BeadPatch, BeadStore};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::actions::{Action, DecodeError, Decoded};
use crate::shell::{ShellRequest, ShellRunner};
use crate::workflow::WorkflowEngine;

/// Wire tag used for the synthesized whole-envelope failure result.
pub const PARSE_FAILURE_ACTION: &str = "auto_file_parse_failure";

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Error,
    ParseFailed,
}

/// The result of one routed action, in the shape agents see it.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action_type: String,
    pub status: OutcomeStatus,
    pub message: String,
    pub metadata: Value,
}

impl ActionOutcome {
    fn ok(action_type: &str, message: impl Into<String>, metadata: Value) -> Self {
        Self {
            action_type: action_type.to_string(),
            status: OutcomeStatus::Ok,
            message: message.into(),
            metadata,
        }
    }

    fn error(action_type: &str, message: impl Into<String>) -> Self {
        Self {
            action_type: action_type.to_string(),
            status: OutcomeStatus::Error,
            message: message.into(),
            metadata: json!({}),
        }
    }

    fn parse_failed(action_type: &str, message: impl Into<String>, metadata: Value) -> Self {
        Self {
            action_type: action_type.to_string(),
            status: OutcomeStatus::ParseFailed,
            message: message.into(),
            metadata,
        }
    }

    /// Render as the system message appended to the conversation.
    pub fn to_system_message(&self) -> ChatMessage {
        let body = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"action_type\":\"{}\",\"status\":\"error\",\"message\":\"unserializable outcome\",\"metadata\":{{}}}}",
                self.action_type
            )
        });
        ChatMessage::system(body)
    }
}

/// What a batch of actions did, summarized for the executor loop.
#[derive(Debug, Default)]
pub struct RouteReport {
    pub outcomes: Vec<ActionOutcome>,
    /// A `done` action fired.
    pub done: bool,
    /// The bead under execution was closed by one of the actions.
    pub bead_closed: bool,
}

/// The identity an action batch runs under.
#[derive(Debug, Clone)]
pub struct RouteScope {
    pub agent_id: String,
    pub bead_id: String,
    pub project_id: String,
    pub worktree: PathBuf,
}

// ---------------------------------------------------------------------------
// ActionRouter
// ---------------------------------------------------------------------------

pub struct ActionRouter {
    store: Arc<BeadStore>,
    decisions: Arc<DecisionManager>,
    locks: Arc<FileLockManager>,
    shell: Arc<dyn ShellRunner>,
    workflow: Arc<WorkflowEngine>,
    contexts: Arc<ContextStore>,
    /// Command that prepares the project's build environment, when configured.
    build_env_command: Option<String>,
}

impl ActionRouter {
    pub fn new(
        store: Arc<BeadStore>,
        decisions: Arc<DecisionManager>,
        locks: Arc<FileLockManager>,
        shell: Arc<dyn ShellRunner>,
        workflow: Arc<WorkflowEngine>,
        contexts: Arc<ContextStore>,
    ) -> Self {
        Self {
            store,
            decisions,
            locks,
            shell,
            workflow,
            contexts,
            build_env_command: None,
        }
    }

    pub fn with_build_env_command(mut self, command: impl Into<String>) -> Self {
        self.build_env_command = Some(command.into());
        self
    }

    /// Route a decoded batch. Per-action parse failures become
    /// `parse_failed` outcomes; everything else is dispatched in order.
    pub async fn route(&self, scope: &RouteScope, decoded: Vec<Decoded>) -> RouteReport {
        let mut report = RouteReport::default();
        for entry in decoded {
            let outcome = match entry {
                Decoded::Action(action) => self.dispatch(scope, &action, &mut report).await,
                Decoded::Failure { raw, error } => ActionOutcome::parse_failed(
                    PARSE_FAILURE_ACTION,
                    format!("action failed to decode: {error}"),
                    json!({ "raw": raw }),
                ),
            };
            self.record(scope, &outcome);
            report.outcomes.push(outcome);
        }
        report
    }

    /// Synthesize the single result for a response with no usable envelope.
    /// The bead stays open; the error is surfaced to the agent's next turn.
    pub fn route_envelope_failure(&self, scope: &RouteScope, error: &DecodeError) -> RouteReport {
        let outcome = ActionOutcome::parse_failed(
            PARSE_FAILURE_ACTION,
            format!("response contained no decodable action envelope: {error}"),
            json!({}),
        );
        self.record(scope, &outcome);
        RouteReport {
            outcomes: vec![outcome],
            done: false,
            bead_closed: false,
        }
    }

    fn record(&self, scope: &RouteScope, outcome: &ActionOutcome) {
        self.contexts
            .append(&scope.bead_id, outcome.to_system_message());
        info!(
            agent = %scope.agent_id,
            bead_id = %scope.bead_id,
            project = %scope.project_id,
            action = %outcome.action_type,
            status = ?outcome.status,
            message = %outcome.message,
            "action routed"
        );
    }

    async fn dispatch(
        &self,
        scope: &RouteScope,
        action: &Action,
        report: &mut RouteReport,
    ) -> ActionOutcome {
        let kind = action.kind();
        match action {
            // -- bead family -------------------------------------------------
            Action::BeadCreate {
                title,
                description,
                priority,
            } => match self
                .store
                .create(
                    title.clone(),
                    description.clone(),
                    *priority,
                    BeadType::Task,
                    &scope.project_id,
                )
                .await
            {
                Ok(bead) => ActionOutcome::ok(
                    kind,
                    format!("created {}", bead.id),
                    json!({ "bead_id": bead.id }),
                ),
                Err(e) => ActionOutcome::error(kind, e.to_string()),
            },
            Action::BeadClose { bead_id, reason } => {
                match self
                    .store
                    .update(bead_id, BeadPatch::status(BeadStatus::Closed))
                    .await
                {
                    Ok(_) => {
                        if bead_id == &scope.bead_id {
                            report.bead_closed = true;
                        }
                        ActionOutcome::ok(
                            kind,
                            format!("closed {bead_id}"),
                            json!({ "bead_id": bead_id, "reason": reason }),
                        )
                    }
                    Err(e) => ActionOutcome::error(kind, e.to_string()),
                }
            }
            Action::BeadUpdate {
                bead_id,
                title,
                description,
                priority,
            } => {
                let patch = BeadPatch {
                    title: title.clone(),
                    description: description.clone(),
                    priority: *priority,
                    ..Default::default()
                };
                match self.store.update(bead_id, patch).await {
                    Ok(_) => ActionOutcome::ok(
                        kind,
                        format!("updated {bead_id}"),
                        json!({ "bead_id": bead_id }),
                    ),
                    Err(e) => ActionOutcome::error(kind, e.to_string()),
                }
            }
            Action::AddDependency { from, to } => {
                match self
                    .store
                    .add_dependency(from, to, DependencyKind::Blocks)
                    .await
                {
                    Ok(()) => ActionOutcome::ok(
                        kind,
                        format!("{from} now blocked by {to}"),
                        json!({ "from": from, "to": to }),
                    ),
                    Err(e) => ActionOutcome::error(kind, e.to_string()),
                }
            }
            Action::Escalate { bead_id, reason } => {
                match self
                    .decisions
                    .escalate_to_ceo(bead_id, reason, &scope.agent_id)
                    .await
                {
                    Ok(decision) => ActionOutcome::ok(
                        kind,
                        format!("escalated {bead_id} as {}", decision.id),
                        json!({ "decision_id": decision.id }),
                    ),
                    Err(e) => ActionOutcome::error(kind, e.to_string()),
                }
            }

            // -- file family -------------------------------------------------
            Action::FileRead { path } => match self.resolve_path(scope, path) {
                Ok(full) => match tokio::fs::read_to_string(&full).await {
                    Ok(content) => ActionOutcome::ok(
                        kind,
                        format!("read {path}"),
                        json!({ "path": path, "content": content }),
                    ),
                    Err(e) => ActionOutcome::error(kind, format!("read {path}: {e}")),
                },
                Err(msg) => ActionOutcome::error(kind, msg),
            },
            Action::FileWrite { path, content } => {
                self.write_file(scope, kind, path, content).await
            }
            Action::ApplyPatch { path, patch } => {
                // Delegated to git so hunk application matches what a human
                // would get from `git apply`.
                let command = format!(
                    "git apply --whitespace=nowarn -- {} <<'LOOM_PATCH'\n{}\nLOOM_PATCH",
                    shell_quote(path),
                    patch
                );
                self.run_shell(scope, kind, &command, GIT_TIMEOUT).await
            }
            Action::FileList { path } => match self.resolve_path(scope, path) {
                Ok(full) => match list_dir(&full).await {
                    Ok(entries) => ActionOutcome::ok(
                        kind,
                        format!("{} entries", entries.len()),
                        json!({ "path": path, "entries": entries }),
                    ),
                    Err(e) => ActionOutcome::error(kind, format!("list {path}: {e}")),
                },
                Err(msg) => ActionOutcome::error(kind, msg),
            },
            Action::FileSearch { pattern, path } => {
                let command = format!(
                    "grep -rn -- {} {}",
                    shell_quote(pattern),
                    shell_quote(if path.is_empty() { "." } else { path })
                );
                let result = self
                    .shell
                    .run(&self.shell_request(scope, &command, GIT_TIMEOUT))
                    .await;
                // grep exits 1 on no match; that is an empty result, not a
                // failure.
                if result.success || result.exit_code == 1 {
                    ActionOutcome::ok(
                        kind,
                        format!("{} matching lines", result.stdout.lines().count()),
                        json!({ "matches": result.stdout }),
                    )
                } else {
                    ActionOutcome::error(kind, result.stderr)
                }
            }

            // -- git family (delegated to the shell collaborator) ------------
            Action::GitStatus {} => {
                self.run_shell(scope, kind, "git status --porcelain", GIT_TIMEOUT)
                    .await
            }
            Action::GitCommit { message } => {
                let command = format!("git add -A && git commit -m {}", shell_quote(message));
                self.run_shell(scope, kind, &command, GIT_TIMEOUT).await
            }
            Action::GitPush {} => self.run_shell(scope, kind, "git push", GIT_TIMEOUT).await,
            Action::GitPull {} => {
                self.run_shell(scope, kind, "git pull --ff-only", GIT_TIMEOUT)
                    .await
            }
            Action::GitBranch { name } => {
                let command = format!("git checkout -b {}", shell_quote(name));
                self.run_shell(scope, kind, &command, GIT_TIMEOUT).await
            }
            Action::GitPr { title, body } => {
                let command = format!(
                    "gh pr create --title {} --body {}",
                    shell_quote(title),
                    shell_quote(body)
                );
                self.run_shell(scope, kind, &command, GIT_TIMEOUT).await
            }

            // -- shell -------------------------------------------------------
            Action::Command {
                command,
                working_dir,
                timeout_seconds,
            } => {
                let mut request =
                    self.shell_request(scope, command, Duration::from_secs(*timeout_seconds));
                if let Some(dir) = working_dir {
                    request.working_dir = dir.clone();
                }
                let result = self.shell.run(&request).await;
                shell_outcome(kind, &result)
            }

            // -- environment -------------------------------------------------
            Action::BuildEnv {} => match &self.build_env_command {
                Some(command) => {
                    let command = command.clone();
                    self.run_shell(scope, kind, &command, GIT_TIMEOUT).await
                }
                None => ActionOutcome::ok(kind, "no build environment configured", json!({})),
            },

            // -- workflow ----------------------------------------------------
            Action::WorkflowAdvance { condition } => {
                match self.workflow.execution_for_bead(&scope.bead_id) {
                    None => ActionOutcome::error(kind, "no active workflow for this bead"),
                    Some(execution) => match self.workflow.advance(
                        &execution.id,
                        *condition,
                        &scope.agent_id,
                        json!({}),
                    ) {
                        Ok(advanced) => ActionOutcome::ok(
                            kind,
                            if advanced.terminal {
                                "workflow reached a terminal node".to_string()
                            } else {
                                format!("advanced to {}", advanced.current_node)
                            },
                            json!({
                                "execution_id": advanced.id,
                                "current_node": advanced.current_node,
                                "terminal": advanced.terminal,
                            }),
                        ),
                        Err(e) => ActionOutcome::error(kind, e.to_string()),
                    },
                }
            }

            // -- completion --------------------------------------------------
            Action::Done { reason } => {
                report.done = true;
                ActionOutcome::ok(kind, reason.clone(), json!({}))
            }
        }
    }

    async fn write_file(
        &self,
        scope: &RouteScope,
        kind: &str,
        path: &str,
        content: &str,
    ) -> ActionOutcome {
        let full = match self.resolve_path(scope, path) {
            Ok(full) => full,
            Err(msg) => return ActionOutcome::error(kind, msg),
        };
        if let Err(e) = self
            .locks
            .acquire(&scope.project_id, path, &scope.agent_id, &scope.bead_id)
        {
            return ActionOutcome::error(kind, e.to_string());
        }
        let written = async {
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, content).await
        }
        .await;
        if let Err(e) = self.locks.release(&scope.project_id, path, &scope.agent_id) {
            warn!(path = %path, error = %e, "failed to release file lock after write");
        }
        match written {
            Ok(()) => ActionOutcome::ok(
                kind,
                format!("wrote {path}"),
                json!({ "path": path, "bytes": content.len() }),
            ),
            Err(e) => ActionOutcome::error(kind, format!("write {path}: {e}")),
        }
    }

    async fn run_shell(
        &self,
        scope: &RouteScope,
        kind: &str,
        command: &str,
        timeout: Duration,
    ) -> ActionOutcome {
        let result = self
            .shell
            .run(&self.shell_request(scope, command, timeout))
            .await;
        shell_outcome(kind, &result)
    }

    fn shell_request(&self, scope: &RouteScope, command: &str, timeout: Duration) -> ShellRequest {
        ShellRequest {
            agent_id: scope.agent_id.clone(),
            bead_id: scope.bead_id.clone(),
            project_id: scope.project_id.clone(),
            command: command.to_string(),
            working_dir: scope.worktree.display().to_string(),
            timeout,
        }
    }

    /// Resolve a relative path inside the scope's worktree. Absolute paths
    /// and `..` escapes are rejected.
    fn resolve_path(&self, scope: &RouteScope, path: &str) -> std::result::Result<PathBuf, String> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return Err(format!("absolute paths are not allowed: {path}"));
        }
        if relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!("path escapes the worktree: {path}"));
        }
        Ok(scope.worktree.join(relative))
    }
}

fn shell_outcome(kind: &str, result: &crate::shell::ShellResult) -> ActionOutcome {
    let metadata = json!({
        "exit_code": result.exit_code,
        "stdout": result.stdout,
        "stderr": result.stderr,
        "duration_ms": result.duration_ms,
    });
    if result.success {
        ActionOutcome::ok(kind, "exit 0", metadata)
    } else {
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| format!("exit {}", result.exit_code));
        ActionOutcome {
            action_type: kind.to_string(),
            status: OutcomeStatus::Error,
            message,
            metadata,
        }
    }
}

async fn list_dir(path: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(path).await?;
    while let Some(entry) = reader.next_entry().await? {
        entries.push(entry.file_name().to_string_lossy().into_owned());
    }
    entries.sort();
    Ok(entries)
}

/// Single-quote an argument for `sh -c`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::RecordingShellRunner;
    use loom_bus::EventBus;
    use loom_core::cache::CacheDb;
    use loom_core::types::Priority;

    struct Fixture {
        router: ActionRouter,
        store: Arc<BeadStore>,
        locks: Arc<FileLockManager>,
        shell: Arc<RecordingShellRunner>,
        workflow: Arc<WorkflowEngine>,
        contexts: Arc<ContextStore>,
        scope: RouteScope,
        _worktree: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let cache = Arc::new(CacheDb::new_in_memory().await.unwrap());
        let bus = EventBus::new();
        let store = Arc::new(BeadStore::new(Arc::clone(&cache), bus.clone()));
        let decisions = Arc::new(DecisionManager::new(Arc::clone(&store), bus.clone()));
        let locks = Arc::new(FileLockManager::new(Duration::from_secs(60)));
        let shell = Arc::new(RecordingShellRunner::new());
        let workflow = Arc::new(WorkflowEngine::new());
        let contexts = Arc::new(ContextStore::new(100_000, Duration::from_secs(3600)));
        let worktree = tempfile::tempdir().unwrap();

        let bead = store
            .create("seed", "seed bead", Priority::P2, BeadType::Task, "p")
            .await
            .unwrap();

        let router = ActionRouter::new(
            Arc::clone(&store),
            decisions,
            Arc::clone(&locks),
            shell.clone() as Arc<dyn ShellRunner>,
            Arc::clone(&workflow),
            Arc::clone(&contexts),
        );
        let scope = RouteScope {
            agent_id: "agent-1".into(),
            bead_id: bead.id,
            project_id: "p".into(),
            worktree: worktree.path().to_path_buf(),
        };
        Fixture {
            router,
            store,
            locks,
            shell,
            workflow,
            contexts,
            scope,
            _worktree: worktree,
        }
    }

    #[tokio::test]
    async fn bead_create_reports_new_id() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![Decoded::Action(Action::BeadCreate {
                    title: "follow-up".into(),
                    description: String::new(),
                    priority: Priority::P1,
                })],
            )
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Ok);
        let id = report.outcomes[0].metadata["bead_id"].as_str().unwrap();
        assert_eq!(f.store.get(id).unwrap().title, "follow-up");
    }

    #[tokio::test]
    async fn closing_own_bead_flags_the_report() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![Decoded::Action(Action::BeadClose {
                    bead_id: f.scope.bead_id.clone(),
                    reason: "finished".into(),
                })],
            )
            .await;
        assert!(report.bead_closed);
        assert_eq!(
            f.store.get(&f.scope.bead_id).unwrap().status,
            BeadStatus::Closed
        );
    }

    #[tokio::test]
    async fn done_sets_flag_and_appends_system_message() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![Decoded::Action(Action::Done {
                    reason: "all set".into(),
                })],
            )
            .await;
        assert!(report.done);
        assert!(!report.bead_closed);

        let messages = f.contexts.messages(&f.scope.bead_id);
        assert_eq!(messages.len(), 1);
        let body: Value = serde_json::from_str(&messages[0].content).unwrap();
        assert_eq!(body["action_type"], "done");
        assert_eq!(body["status"], "ok");
        assert_eq!(body["message"], "all set");
        assert!(body["metadata"].is_object());
    }

    #[tokio::test]
    async fn file_write_then_read_roundtrip() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![
                    Decoded::Action(Action::FileWrite {
                        path: "src/lib.rs".into(),
                        content: "pub fn hi() {}".into(),
                    }),
                    Decoded::Action(Action::FileRead {
                        path: "src/lib.rs".into(),
                    }),
                ],
            )
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Ok);
        assert_eq!(report.outcomes[1].metadata["content"], "pub fn hi() {}");
        // the write lock is released once the write lands
        assert!(!f.locks.is_locked("p", "src/lib.rs"));
    }

    #[tokio::test]
    async fn held_lock_turns_write_into_error() {
        let f = fixture().await;
        f.locks.acquire("p", "x.rs", "agent-other", "p-9").unwrap();
        let report = f
            .router
            .route(
                &f.scope,
                vec![Decoded::Action(Action::FileWrite {
                    path: "x.rs".into(),
                    content: "y".into(),
                })],
            )
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Error);
        assert!(report.outcomes[0].message.contains("already locked"));
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![
                    Decoded::Action(Action::FileRead {
                        path: "../secrets".into(),
                    }),
                    Decoded::Action(Action::FileRead {
                        path: "/etc/passwd".into(),
                    }),
                ],
            )
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Error);
        assert_eq!(report.outcomes[1].status, OutcomeStatus::Error);
    }

    #[tokio::test]
    async fn git_actions_delegate_to_shell() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![
                    Decoded::Action(Action::GitStatus {}),
                    Decoded::Action(Action::GitCommit {
                        message: "fix the thing".into(),
                    }),
                ],
            )
            .await;
        assert!(report.outcomes.iter().all(|o| o.status == OutcomeStatus::Ok));
        let commands: Vec<String> = f
            .shell
            .requests()
            .into_iter()
            .map(|r| r.command)
            .collect();
        assert_eq!(commands[0], "git status --porcelain");
        assert_eq!(commands[1], "git add -A && git commit -m 'fix the thing'");
        assert_eq!(
            f.shell.requests()[0].working_dir,
            f.scope.worktree.display().to_string()
        );
    }

    #[tokio::test]
    async fn per_action_parse_failure_does_not_close_bead() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![Decoded::Failure {
                    raw: "{\"type\":\"nope\"}".into(),
                    error: "unknown variant".into(),
                }],
            )
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::ParseFailed);
        assert!(!report.bead_closed);
        assert!(!report.done);
    }

    #[tokio::test]
    async fn envelope_failure_yields_single_synthetic_result() {
        let f = fixture().await;
        let report = f
            .router
            .route_envelope_failure(&f.scope, &DecodeError::NoEnvelope);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, OutcomeStatus::ParseFailed);
        assert_eq!(report.outcomes[0].action_type, PARSE_FAILURE_ACTION);
        assert!(!report.bead_closed);

        // the failure is visible in the conversation for the next turn
        let messages = f.contexts.messages(&f.scope.bead_id);
        assert!(messages[0].content.contains("parse_failed"));
    }

    #[tokio::test]
    async fn workflow_advance_moves_the_execution() {
        let f = fixture().await;
        f.workflow.register(crate::workflow::WorkflowDef {
            id: "wf".into(),
            entry: "start".into(),
            nodes: vec!["start".into(), "end".into()],
            edges: vec![crate::workflow::WorkflowEdge {
                from: "start".into(),
                to: "end".into(),
                condition: crate::actions::WorkflowCondition::Success,
                priority: 0,
            }],
        });
        f.workflow.start("wf", &f.scope.bead_id).unwrap();

        let report = f
            .router
            .route(
                &f.scope,
                vec![Decoded::Action(Action::WorkflowAdvance {
                    condition: crate::actions::WorkflowCondition::Success,
                })],
            )
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Ok);
        assert_eq!(report.outcomes[0].metadata["current_node"], "end");
    }

    #[tokio::test]
    async fn escalate_files_a_p0_decision() {
        let f = fixture().await;
        let report = f
            .router
            .route(
                &f.scope,
                vec![Decoded::Action(Action::Escalate {
                    bead_id: f.scope.bead_id.clone(),
                    reason: "needs sign-off".into(),
                })],
            )
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Ok);
        let decision_id = report.outcomes[0].metadata["decision_id"].as_str().unwrap();
        let decision = f.store.get(decision_id).unwrap();
        assert_eq!(decision.priority, Priority::P0);
        assert_eq!(decision.bead_type, BeadType::Decision);
        assert_eq!(
            f.store.get(&f.scope.bead_id).unwrap().status,
            BeadStatus::Blocked
        );
    }

    #[tokio::test]
    async fn build_env_without_command_is_a_noop_ok() {
        let f = fixture().await;
        let report = f
            .router
            .route(&f.scope, vec![Decoded::Action(Action::BuildEnv {})])
            .await;
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Ok);
        assert!(f.shell.requests().is_empty());
    }
}
