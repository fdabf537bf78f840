//! The action envelope emitted by agents.
//!
//! Agents answer with a JSON envelope `{"actions": [{"type": ..,
//! "payload": ..}, ..]}`. Decoding is lenient about the wrapper (prose and
//! code fences around the JSON are tolerated) and strict about each action:
//! an unknown tag or a payload that misses required fields becomes a
//! ParseFailure entry, never a silent drop. Decoding is deterministic for
//! identical input bytes.

use loom_core::types::Priority;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Action kinds
// ---------------------------------------------------------------------------

/// Workflow edge labels; also the conditions an agent may advance to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCondition {
    Success,
    Failure,
    Approved,
    Rejected,
    Timeout,
    Escalated,
}

impl std::fmt::Display for WorkflowCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WorkflowCondition::Success => "success",
            WorkflowCondition::Failure => "failure",
            WorkflowCondition::Approved => "approved",
            WorkflowCondition::Rejected => "rejected",
            WorkflowCondition::Timeout => "timeout",
            WorkflowCondition::Escalated => "escalated",
        };
        write!(f, "{}", label)
    }
}

fn default_priority() -> Priority {
    Priority::P2
}

fn default_timeout_secs() -> u64 {
    300
}

/// Everything an agent can ask for, as a closed tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Action {
    // Bead family
    BeadCreate {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default = "default_priority")]
        priority: Priority,
    },
    BeadClose {
        bead_id: String,
        #[serde(default)]
        reason: String,
    },
    BeadUpdate {
        bead_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        priority: Option<Priority>,
    },
    AddDependency {
        from: String,
        to: String,
    },
    Escalate {
        bead_id: String,
        reason: String,
    },

    // File family
    FileRead {
        path: String,
    },
    FileWrite {
        path: String,
        content: String,
    },
    ApplyPatch {
        path: String,
        patch: String,
    },
    FileList {
        #[serde(default)]
        path: String,
    },
    FileSearch {
        pattern: String,
        #[serde(default)]
        path: String,
    },

    // Git family (delegated to the shell collaborator)
    GitStatus {},
    GitCommit {
        message: String,
    },
    GitPush {},
    GitPull {},
    GitBranch {
        name: String,
    },
    GitPr {
        title: String,
        #[serde(default)]
        body: String,
    },

    // Shell
    Command {
        command: String,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_seconds: u64,
    },

    // Environment
    BuildEnv {},

    // Workflow
    WorkflowAdvance {
        condition: WorkflowCondition,
    },

    // Completion
    Done {
        #[serde(default)]
        reason: String,
    },
}

impl Action {
    /// The wire tag, used in result records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::BeadCreate { .. } => "bead_create",
            Action::BeadClose { .. } => "bead_close",
            Action::BeadUpdate { .. } => "bead_update",
            Action::AddDependency { .. } => "add_dependency",
            Action::Escalate { .. } => "escalate",
            Action::FileRead { .. } => "file_read",
            Action::FileWrite { .. } => "file_write",
            Action::ApplyPatch { .. } => "apply_patch",
            Action::FileList { .. } => "file_list",
            Action::FileSearch { .. } => "file_search",
            Action::GitStatus {} => "git_status",
            Action::GitCommit { .. } => "git_commit",
            Action::GitPush {} => "git_push",
            Action::GitPull {} => "git_pull",
            Action::GitBranch { .. } => "git_branch",
            Action::GitPr { .. } => "git_pr",
            Action::Command { .. } => "command",
            Action::BuildEnv {} => "build_env",
            Action::WorkflowAdvance { .. } => "workflow_advance",
            Action::Done { .. } => "done",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The text contains no JSON envelope at all.
    #[error("no action envelope found in response")]
    NoEnvelope,
    #[error("envelope is not valid JSON: {0}")]
    BadJson(String),
    #[error("envelope has no actions array")]
    MissingActions,
}

/// One entry of a decoded envelope: either a valid action or a
/// per-action parse failure carrying the offending JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Action(Action),
    Failure { raw: String, error: String },
}

#[derive(Deserialize)]
struct Envelope {
    actions: Option<Vec<serde_json::Value>>,
}

/// Decode an agent response into actions.
///
/// The JSON envelope may be wrapped in prose or markdown code fences; the
/// decoder extracts the outermost `{...}` block. Each action is decoded
/// independently so one malformed entry does not hide the rest.
pub fn decode_envelope(text: &str) -> Result<Vec<Decoded>, DecodeError> {
    let json = extract_json_block(text).ok_or(DecodeError::NoEnvelope)?;
    let envelope: Envelope =
        serde_json::from_str(json).map_err(|e| DecodeError::BadJson(e.to_string()))?;
    let actions = envelope.actions.ok_or(DecodeError::MissingActions)?;

    let mut out = Vec::with_capacity(actions.len());
    for value in actions {
        match serde_json::from_value::<Action>(value.clone()) {
            Ok(action) => out.push(Decoded::Action(action)),
            Err(e) => out.push(Decoded::Failure {
                raw: value.to_string(),
                error: e.to_string(),
            }),
        }
    }
    Ok(out)
}

/// Find the outermost balanced `{...}` block, skipping fences and prose.
/// Brace counting respects JSON string literals.
fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
