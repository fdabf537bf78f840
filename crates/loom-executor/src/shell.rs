//! Shell-command collaborator.
//!
//! The shell executor is external; this module pins down its contract and
//! provides the process-backed default plus a recording mock. Every
//! invocation is persisted to the request log with inputs, outputs, and
//! timing.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_core::cache::CacheDb;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub agent_id: String,
    pub bead_id: String,
    pub project_id: String,
    pub command: String,
    pub working_dir: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellResult {
    pub id: String,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Seam to the external shell executor. The real one spawns processes; the
/// mock records invocations and plays back scripted results.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(&self, request: &ShellRequest) -> ShellResult;
}

// ---------------------------------------------------------------------------
// ProcessShellRunner
// ---------------------------------------------------------------------------

/// Runs commands through `sh -c` with a hard timeout, persisting every
/// invocation to the request log.
pub struct ProcessShellRunner {
    cache: Arc<CacheDb>,
}

impl ProcessShellRunner {
    pub fn new(cache: Arc<CacheDb>) -> Self {
        Self { cache }
    }

    async fn spawn(request: &ShellRequest) -> (i32, String, String, Option<String>) {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !request.working_dir.is_empty() {
            cmd.current_dir(&request.working_dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return (-1, String::new(), String::new(), Some(e.to_string())),
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait = async {
            let status = child.wait().await;
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            (status, stdout, stderr)
        };

        match tokio::time::timeout(request.timeout, wait).await {
            Ok((Ok(status), stdout, stderr)) => {
                (status.code().unwrap_or(-1), stdout, stderr, None)
            }
            Ok((Err(e), stdout, stderr)) => (-1, stdout, stderr, Some(e.to_string())),
            Err(_) => (
                -1,
                String::new(),
                String::new(),
                Some(format!("timed out after {:?}", request.timeout)),
            ),
        }
    }
}

#[async_trait]
impl ShellRunner for ProcessShellRunner {
    async fn run(&self, request: &ShellRequest) -> ShellResult {
        let id = format!("shell-{}", uuid::Uuid::new_v4());
        let started_at = Utc::now();
        let started = Instant::now();

        let (exit_code, stdout, stderr, error) = Self::spawn(request).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = ShellResult {
            id: id.clone(),
            command: request.command.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms,
            started_at,
            completed_at: Utc::now(),
            success: exit_code == 0 && error.is_none(),
            error,
        };

        let detail = serde_json::to_string(&result).unwrap_or_default();
        if let Err(e) = self
            .cache
            .log_request(
                &id,
                "shell",
                Some(&request.agent_id),
                Some(&request.bead_id),
                Some(&request.project_id),
                &detail,
                duration_ms,
                result.success,
            )
            .await
        {
            warn!(error = %e, "failed to persist shell invocation");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// RecordingShellRunner (test collaborator)
// ---------------------------------------------------------------------------

/// Records every request and answers with scripted results, default success.
pub struct RecordingShellRunner {
    requests: std::sync::Mutex<Vec<ShellRequest>>,
    responses: std::sync::Mutex<Vec<ShellResult>>,
}

impl RecordingShellRunner {
    pub fn new() -> Self {
        Self {
            requests: std::sync::Mutex::new(Vec::new()),
            responses: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push_result(&self, result: ShellResult) {
        self.responses.lock().expect("shell mock lock").push(result);
    }

    pub fn requests(&self) -> Vec<ShellRequest> {
        self.requests.lock().expect("shell mock lock").clone()
    }

    pub fn ok_result(command: &str, stdout: &str) -> ShellResult {
        let now = Utc::now();
        ShellResult {
            id: format!("shell-{}", uuid::Uuid::new_v4()),
            command: command.to_string(),
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 1,
            started_at: now,
            completed_at: now,
            success: true,
            error: None,
        }
    }
}

impl Default for RecordingShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellRunner for RecordingShellRunner {
    async fn run(&self, request: &ShellRequest) -> ShellResult {
        self.requests
            .lock()
            .expect("shell mock lock")
            .push(request.clone());
        let scripted = self.responses.lock().expect("shell mock lock").pop();
        scripted.unwrap_or_else(|| Self::ok_result(&request.command, ""))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
