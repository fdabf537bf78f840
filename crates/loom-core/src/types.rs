use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version stamped into every federated bead record.
pub const BEAD_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// BeadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    Blocked,
    InProgress,
    Closed,
}

impl BeadStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Closed` is terminal; everything else may move forward or be
    /// reopened through recovery paths.
    pub fn can_transition_to(&self, target: &BeadStatus) -> bool {
        if self == target {
            return true;
        }
        !matches!(self, BeadStatus::Closed)
    }

    /// Monotonic rank used when merging federated records:
    /// open < blocked < in_progress < closed.
    pub fn merge_rank(&self) -> u8 {
        match self {
            BeadStatus::Open => 0,
            BeadStatus::Blocked => 1,
            BeadStatus::InProgress => 2,
            BeadStatus::Closed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BeadStatus::Closed)
    }
}

impl std::fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BeadStatus::Open => "open",
            BeadStatus::Blocked => "blocked",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// BeadType / Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadType {
    Task,
    Decision,
    Epic,
}

/// Bead priority. `P0` is the most urgent and sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// DependencyKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Blocks,
    RelatedTo,
    Parent,
}

// ---------------------------------------------------------------------------
// DecisionData
// ---------------------------------------------------------------------------

/// Decision-specific fields carried by beads of type `Decision`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionData {
    pub question: String,
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    pub requested_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// The unit of work. Beads form a DAG through `blocks` and `parent` edges
/// and are federated across worktrees as JSONL records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(rename = "type")]
    pub bead_type: BeadType,
    pub title: String,
    pub description: String,
    pub status: BeadStatus,
    pub priority: Priority,
    pub project_id: String,
    /// Agent ID holding this bead; empty string means unassigned.
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub related_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    BEAD_SCHEMA_VERSION
}

impl Bead {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
        bead_type: BeadType,
        project_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            bead_type,
            title: title.into(),
            description: description.into(),
            status: BeadStatus::Open,
            priority,
            project_id: project_id.into(),
            assigned_to: String::new(),
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            related_to: Vec::new(),
            parent: None,
            children: Vec::new(),
            tags: Vec::new(),
            context: HashMap::new(),
            decision: None,
            due_date: None,
            created_at: now,
            updated_at: now,
            schema_version: BEAD_SCHEMA_VERSION,
        }
    }

    pub fn is_assigned(&self) -> bool {
        !self.assigned_to.is_empty()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// AgentStatus / Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Paused,
    Idle,
    Working,
    Deciding,
    Blocked,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AgentStatus::Paused => "paused",
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Deciding => "deciding",
            AgentStatus::Blocked => "blocked",
        };
        write!(f, "{}", label)
    }
}

/// Persona bound to an agent: a display name plus the prompt body injected
/// as the system message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: String,
    pub persona: Persona,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_bead: Option<String>,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_position: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
        persona: Persona,
        project_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            persona,
            provider_id: None,
            status: AgentStatus::Paused,
            current_bead: None,
            project_id: project_id.into(),
            org_position: None,
            started_at: now,
            last_active: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenaiLike,
    Ollama,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Healthy,
    Active,
    Unhealthy,
}

impl ProviderStatus {
    /// Active and Healthy providers may serve completions.
    pub fn is_usable(&self) -> bool {
        matches!(self, ProviderStatus::Active | ProviderStatus::Healthy)
    }
}

/// Result of the most recent health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub provider_type: ProviderType,
    pub endpoint: String,
    /// Reference to the credential (env var name), never the secret itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<String>,
    pub configured_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    pub status: ProviderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<Heartbeat>,
}

impl Provider {
    /// Normalize the endpoint the way the wire protocol expects:
    /// OpenAI-shaped endpoints get a `/v1` suffix when absent, Ollama
    /// endpoints are kept as-is.
    pub fn normalized_endpoint(&self) -> String {
        let trimmed = self.endpoint.trim_end_matches('/');
        match self.provider_type {
            ProviderType::Ollama | ProviderType::Mock => trimmed.to_string(),
            ProviderType::OpenaiLike => {
                if trimmed.ends_with("/v1") {
                    trimmed.to_string()
                } else {
                    format!("{}/v1", trimmed)
                }
            }
        }
    }

    /// The model sent on the wire: the probed selection when present,
    /// otherwise the configured one.
    pub fn model(&self) -> &str {
        self.selected_model.as_deref().unwrap_or(&self.configured_model)
    }
}

// ---------------------------------------------------------------------------
// FileLock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    pub project_id: String,
    pub path: String,
    pub agent_id: String,
    pub bead_id: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Rough token estimate (4 chars per token) used for context budgeting.
    pub fn token_estimate(&self) -> usize {
        self.content.len().div_ceil(4)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An ephemeral event published on the in-process bus. Subscribers only see
/// events published after they subscribed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bead_id: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            project_id: None,
            bead_id: None,
            data: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_bead(mut self, bead_id: impl Into<String>) -> Self {
        self.bead_id = Some(bead_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        assert!(!BeadStatus::Closed.can_transition_to(&BeadStatus::Open));
        assert!(BeadStatus::Open.can_transition_to(&BeadStatus::InProgress));
        assert!(BeadStatus::Blocked.can_transition_to(&BeadStatus::Open));
    }

    #[test]
    fn merge_rank_is_monotonic() {
        assert!(BeadStatus::Open.merge_rank() < BeadStatus::Blocked.merge_rank());
        assert!(BeadStatus::Blocked.merge_rank() < BeadStatus::InProgress.merge_rank());
        assert!(BeadStatus::InProgress.merge_rank() < BeadStatus::Closed.merge_rank());
    }

    #[test]
    fn priority_orders_p0_first() {
        let mut prios = vec![Priority::P3, Priority::P0, Priority::P2, Priority::P1];
        prios.sort();
        assert_eq!(
            prios,
            vec![Priority::P0, Priority::P1, Priority::P2, Priority::P3]
        );
    }

    #[test]
    fn new_bead_is_open_and_unassigned() {
        let bead = Bead::new("p-1", "title", "desc", Priority::P2, BeadType::Task, "p");
        assert_eq!(bead.status, BeadStatus::Open);
        assert!(!bead.is_assigned());
        assert_eq!(bead.schema_version, BEAD_SCHEMA_VERSION);
    }

    #[test]
    fn endpoint_normalization() {
        let mut provider = Provider {
            id: "prov-1".into(),
            provider_type: ProviderType::OpenaiLike,
            endpoint: "http://localhost:8000".into(),
            key_ref: None,
            configured_model: "m".into(),
            selected_model: None,
            status: ProviderStatus::Pending,
            last_heartbeat: None,
        };
        assert_eq!(provider.normalized_endpoint(), "http://localhost:8000/v1");

        provider.endpoint = "http://localhost:8000/v1/".into();
        assert_eq!(provider.normalized_endpoint(), "http://localhost:8000/v1");

        provider.provider_type = ProviderType::Ollama;
        provider.endpoint = "http://localhost:11434".into();
        assert_eq!(provider.normalized_endpoint(), "http://localhost:11434");
    }

    #[test]
    fn provider_model_prefers_selection() {
        let provider = Provider {
            id: "prov-1".into(),
            provider_type: ProviderType::Mock,
            endpoint: "mock".into(),
            key_ref: None,
            configured_model: "configured".into(),
            selected_model: Some("selected".into()),
            status: ProviderStatus::Active,
            last_heartbeat: None,
        };
        assert_eq!(provider.model(), "selected");
    }

    #[test]
    fn bead_record_roundtrip() {
        let mut bead = Bead::new("pr-7", "t", "d", Priority::P1, BeadType::Decision, "pr");
        bead.decision = Some(DecisionData {
            question: "ship it?".into(),
            options: vec!["yes".into(), "no".into()],
            requested_by: "agent-1".into(),
            ..Default::default()
        });
        let json = serde_json::to_string(&bead).unwrap();
        let parsed: Bead = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "pr-7");
        assert_eq!(parsed.decision.unwrap().options.len(), 2);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(ChatMessage::user("abcd").token_estimate(), 1);
        assert_eq!(ChatMessage::user("abcde").token_estimate(), 2);
        assert_eq!(ChatMessage::user("").token_estimate(), 0);
    }
}
