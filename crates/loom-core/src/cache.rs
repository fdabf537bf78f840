//! Async SQLite mirror for beads, agents, providers, and request logs.
//!
//! The in-memory owners (BeadStore, AgentManager, ProviderRegistry) are the
//! source of truth at runtime; every write lands there first and is then
//! written through here. Reads at startup rehydrate the owners.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use crate::types::{Agent, AgentStatus, Bead, BeadStatus, Persona, Provider, ProviderStatus};

/// Async SQLite-backed mirror.
pub struct CacheDb {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

impl CacheDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS beads (
                        id          TEXT PRIMARY KEY,
                        bead_type   TEXT NOT NULL,
                        title       TEXT NOT NULL,
                        description TEXT NOT NULL,
                        status      TEXT NOT NULL,
                        priority    TEXT NOT NULL,
                        project_id  TEXT NOT NULL,
                        assigned_to TEXT NOT NULL DEFAULT '',
                        edges       TEXT NOT NULL,
                        tags        TEXT NOT NULL,
                        context     TEXT NOT NULL,
                        decision    TEXT,
                        due_date    TEXT,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL,
                        schema_version INTEGER NOT NULL DEFAULT 1
                    );

                    CREATE INDEX IF NOT EXISTS idx_beads_status  ON beads(status);
                    CREATE INDEX IF NOT EXISTS idx_beads_project ON beads(project_id);

                    CREATE TABLE IF NOT EXISTS agents (
                        id           TEXT PRIMARY KEY,
                        name         TEXT NOT NULL,
                        role         TEXT NOT NULL,
                        persona_name TEXT NOT NULL,
                        persona_body TEXT NOT NULL,
                        provider_id  TEXT,
                        status       TEXT NOT NULL,
                        current_bead TEXT,
                        project_id   TEXT NOT NULL,
                        org_position TEXT,
                        started_at   TEXT NOT NULL,
                        last_active  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(project_id);
                    CREATE INDEX IF NOT EXISTS idx_agents_status  ON agents(status);

                    CREATE TABLE IF NOT EXISTS providers (
                        id               TEXT PRIMARY KEY,
                        provider_type    TEXT NOT NULL,
                        endpoint         TEXT NOT NULL,
                        key_ref          TEXT,
                        configured_model TEXT NOT NULL,
                        selected_model   TEXT,
                        status           TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS projects (
                        id         TEXT PRIMARY KEY,
                        config     TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS contexts (
                        bead_id    TEXT PRIMARY KEY,
                        messages   TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS request_log (
                        id          TEXT PRIMARY KEY,
                        kind        TEXT NOT NULL,
                        agent_id    TEXT,
                        bead_id     TEXT,
                        project_id  TEXT,
                        detail      TEXT NOT NULL,
                        duration_ms INTEGER NOT NULL,
                        success     INTEGER NOT NULL,
                        created_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_request_log_kind ON request_log(kind);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Bead CRUD
    // -----------------------------------------------------------------------

    pub async fn upsert_bead(&self, bead: &Bead) -> Result<(), tokio_rusqlite::Error> {
        let id = bead.id.clone();
        let bead_type = enum_to_sql(&bead.bead_type);
        let title = bead.title.clone();
        let description = bead.description.clone();
        let status = enum_to_sql(&bead.status);
        let priority = enum_to_sql(&bead.priority);
        let project_id = bead.project_id.clone();
        let assigned_to = bead.assigned_to.clone();
        let edges = serde_json::to_string(&BeadEdges::from(bead)).expect("serialize edges");
        let tags = serde_json::to_string(&bead.tags).expect("serialize tags");
        let context = serde_json::to_string(&bead.context).expect("serialize context");
        let decision = bead
            .decision
            .as_ref()
            .map(|d| serde_json::to_string(d).expect("serialize decision"));
        let due_date = bead.due_date.map(|d| d.to_rfc3339());
        let created_at = bead.created_at.to_rfc3339();
        let updated_at = bead.updated_at.to_rfc3339();
        let schema_version = bead.schema_version as i64;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO beads (id, bead_type, title, description, status, priority,
                        project_id, assigned_to, edges, tags, context, decision, due_date,
                        created_at, updated_at, schema_version)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                     ON CONFLICT(id) DO UPDATE SET
                        bead_type=excluded.bead_type, title=excluded.title,
                        description=excluded.description, status=excluded.status,
                        priority=excluded.priority, project_id=excluded.project_id,
                        assigned_to=excluded.assigned_to, edges=excluded.edges,
                        tags=excluded.tags, context=excluded.context,
                        decision=excluded.decision, due_date=excluded.due_date,
                        updated_at=excluded.updated_at,
                        schema_version=excluded.schema_version",
                    rusqlite::params![
                        id, bead_type, title, description, status, priority, project_id,
                        assigned_to, edges, tags, context, decision, due_date, created_at,
                        updated_at, schema_version,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_bead(&self, id: &str) -> Result<Option<Bead>, tokio_rusqlite::Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{BEAD_SELECT} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_bead(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn list_beads(&self) -> Result<Vec<Bead>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(BEAD_SELECT)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_bead(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn list_beads_by_status(
        &self,
        status: BeadStatus,
    ) -> Result<Vec<Bead>, tokio_rusqlite::Error> {
        let status = enum_to_sql(&status);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{BEAD_SELECT} WHERE status = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![status])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_bead(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete_beads_by_project(
        &self,
        project_id: &str,
    ) -> Result<usize, tokio_rusqlite::Error> {
        let project_id = project_id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM beads WHERE project_id = ?1",
                    rusqlite::params![project_id],
                )?;
                Ok(n)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Agent CRUD
    // -----------------------------------------------------------------------

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), tokio_rusqlite::Error> {
        let id = agent.id.clone();
        let name = agent.name.clone();
        let role = agent.role.clone();
        let persona_name = agent.persona.name.clone();
        let persona_body = agent.persona.body.clone();
        let provider_id = agent.provider_id.clone();
        let status = enum_to_sql(&agent.status);
        let current_bead = agent.current_bead.clone();
        let project_id = agent.project_id.clone();
        let org_position = agent.org_position.clone();
        let started_at = agent.started_at.to_rfc3339();
        let last_active = agent.last_active.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, role, persona_name, persona_body,
                        provider_id, status, current_bead, project_id, org_position,
                        started_at, last_active)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, role=excluded.role,
                        persona_name=excluded.persona_name,
                        persona_body=excluded.persona_body,
                        provider_id=excluded.provider_id, status=excluded.status,
                        current_bead=excluded.current_bead,
                        project_id=excluded.project_id,
                        org_position=excluded.org_position,
                        last_active=excluded.last_active",
                    rusqlite::params![
                        id, name, role, persona_name, persona_body, provider_id, status,
                        current_bead, project_id, org_position, started_at, last_active,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(AGENT_SELECT)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete_agent(&self, id: &str) -> Result<(), tokio_rusqlite::Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM agents WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Provider CRUD
    // -----------------------------------------------------------------------

    pub async fn upsert_provider(&self, provider: &Provider) -> Result<(), tokio_rusqlite::Error> {
        let id = provider.id.clone();
        let provider_type = enum_to_sql(&provider.provider_type);
        let endpoint = provider.endpoint.clone();
        let key_ref = provider.key_ref.clone();
        let configured_model = provider.configured_model.clone();
        let selected_model = provider.selected_model.clone();
        let status = enum_to_sql(&provider.status);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO providers (id, provider_type, endpoint, key_ref,
                        configured_model, selected_model, status)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT(id) DO UPDATE SET
                        provider_type=excluded.provider_type, endpoint=excluded.endpoint,
                        key_ref=excluded.key_ref,
                        configured_model=excluded.configured_model,
                        selected_model=excluded.selected_model, status=excluded.status",
                    rusqlite::params![
                        id, provider_type, endpoint, key_ref, configured_model,
                        selected_model, status,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_providers(&self) -> Result<Vec<Provider>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, provider_type, endpoint, key_ref, configured_model,
                            selected_model, status
                     FROM providers",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_provider(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete_provider(&self, id: &str) -> Result<(), tokio_rusqlite::Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM providers WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn upsert_project(
        &self,
        id: &str,
        config_json: &str,
    ) -> Result<(), tokio_rusqlite::Error> {
        let id = id.to_string();
        let config_json = config_json.to_string();
        let updated_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, config, updated_at) VALUES (?1,?2,?3)
                     ON CONFLICT(id) DO UPDATE SET
                        config=excluded.config, updated_at=excluded.updated_at",
                    rusqlite::params![id, config_json, updated_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_projects(&self) -> Result<Vec<(String, String)>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, config FROM projects")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
                }
                Ok(out)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Request log
    // -----------------------------------------------------------------------

    /// Persist one external call (provider chat, shell invocation) for
    /// downstream analytics.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_request(
        &self,
        id: &str,
        kind: &str,
        agent_id: Option<&str>,
        bead_id: Option<&str>,
        project_id: Option<&str>,
        detail: &str,
        duration_ms: u64,
        success: bool,
    ) -> Result<(), tokio_rusqlite::Error> {
        let id = id.to_string();
        let kind = kind.to_string();
        let agent_id = agent_id.map(str::to_string);
        let bead_id = bead_id.map(str::to_string);
        let project_id = project_id.map(str::to_string);
        let detail = detail.to_string();
        let created_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO request_log (id, kind, agent_id, bead_id, project_id,
                        detail, duration_ms, success, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        id,
                        kind,
                        agent_id,
                        bead_id,
                        project_id,
                        detail,
                        duration_ms as i64,
                        success as i64,
                        created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn count_requests(&self, kind: &str) -> Result<u64, tokio_rusqlite::Error> {
        let kind = kind.to_string();
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare("SELECT COUNT(*) FROM request_log WHERE kind = ?1")?
                    .query_row(rusqlite::params![kind], |r| r.get(0))?;
                Ok(n)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const BEAD_SELECT: &str = "SELECT id, bead_type, title, description, status, priority,
        project_id, assigned_to, edges, tags, context, decision, due_date,
        created_at, updated_at, schema_version
 FROM beads";

const AGENT_SELECT: &str = "SELECT id, name, role, persona_name, persona_body, provider_id,
        status, current_bead, project_id, org_position, started_at, last_active
 FROM agents";

/// Edge lists packed into one JSON column.
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct BeadEdges {
    blocked_by: Vec<String>,
    blocks: Vec<String>,
    related_to: Vec<String>,
    parent: Option<String>,
    children: Vec<String>,
}

impl From<&Bead> for BeadEdges {
    fn from(bead: &Bead) -> Self {
        Self {
            blocked_by: bead.blocked_by.clone(),
            blocks: bead.blocks.clone(),
            related_to: bead.related_to.clone(),
            parent: bead.parent.clone(),
            children: bead.children.clone(),
        }
    }
}

fn row_to_bead(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bead> {
    let bead_type: String = row.get(1)?;
    let status: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let edges_json: String = row.get(8)?;
    let tags_json: String = row.get(9)?;
    let context_json: String = row.get(10)?;
    let decision_json: Option<String> = row.get(11)?;
    let due_date: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    let schema_version: i64 = row.get(15)?;

    let edges: BeadEdges = serde_json::from_str(&edges_json).expect("valid edges json");
    let tags: Vec<String> = serde_json::from_str(&tags_json).expect("valid tags json");
    let context: HashMap<String, String> =
        serde_json::from_str(&context_json).expect("valid context json");

    Ok(Bead {
        id: row.get(0)?,
        bead_type: enum_from_sql(&bead_type),
        title: row.get(2)?,
        description: row.get(3)?,
        status: enum_from_sql(&status),
        priority: enum_from_sql(&priority),
        project_id: row.get(6)?,
        assigned_to: row.get(7)?,
        blocked_by: edges.blocked_by,
        blocks: edges.blocks,
        related_to: edges.related_to,
        parent: edges.parent,
        children: edges.children,
        tags,
        context,
        decision: decision_json.map(|s| serde_json::from_str(&s).expect("valid decision json")),
        due_date: due_date.map(|s| ts_from_sql(&s)),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
        schema_version: schema_version as u32,
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let status: String = row.get(6)?;
    let started_at: String = row.get(10)?;
    let last_active: String = row.get(11)?;

    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        persona: Persona {
            name: row.get(3)?,
            body: row.get(4)?,
        },
        provider_id: row.get(5)?,
        status: enum_from_sql::<AgentStatus>(&status),
        current_bead: row.get(7)?,
        project_id: row.get(8)?,
        org_position: row.get(9)?,
        started_at: ts_from_sql(&started_at),
        last_active: ts_from_sql(&last_active),
    })
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<Provider> {
    let provider_type: String = row.get(1)?;
    let status: String = row.get(6)?;

    Ok(Provider {
        id: row.get(0)?,
        provider_type: enum_from_sql(&provider_type),
        endpoint: row.get(2)?,
        key_ref: row.get(3)?,
        configured_model: row.get(4)?,
        selected_model: row.get(5)?,
        status: enum_from_sql::<ProviderStatus>(&status),
        last_heartbeat: None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeadType, Priority, ProviderType};

    fn make_bead(id: &str) -> Bead {
        let mut bead = Bead::new(id, "title", "desc", Priority::P1, BeadType::Task, "proj");
        bead.tags.push("test".into());
        bead.blocked_by.push("proj-0".into());
        bead.context.insert("k".into(), "v".into());
        bead
    }

    #[tokio::test]
    async fn bead_write_read_roundtrip() {
        let db = CacheDb::new_in_memory().await.unwrap();
        let bead = make_bead("proj-1");
        db.upsert_bead(&bead).await.unwrap();

        let loaded = db.get_bead("proj-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "title");
        assert_eq!(loaded.status, BeadStatus::Open);
        assert_eq!(loaded.blocked_by, vec!["proj-0".to_string()]);
        assert_eq!(loaded.context.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn bead_upsert_overwrites() {
        let db = CacheDb::new_in_memory().await.unwrap();
        let mut bead = make_bead("proj-1");
        db.upsert_bead(&bead).await.unwrap();

        bead.status = BeadStatus::InProgress;
        bead.assigned_to = "agent-1".into();
        db.upsert_bead(&bead).await.unwrap();

        let loaded = db.get_bead("proj-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, BeadStatus::InProgress);
        assert_eq!(loaded.assigned_to, "agent-1");
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let db = CacheDb::new_in_memory().await.unwrap();
        db.upsert_bead(&make_bead("proj-1")).await.unwrap();
        let mut closed = make_bead("proj-2");
        closed.status = BeadStatus::Closed;
        db.upsert_bead(&closed).await.unwrap();

        let open = db.list_beads_by_status(BeadStatus::Open).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "proj-1");
    }

    #[tokio::test]
    async fn delete_by_project() {
        let db = CacheDb::new_in_memory().await.unwrap();
        db.upsert_bead(&make_bead("proj-1")).await.unwrap();
        db.upsert_bead(&make_bead("proj-2")).await.unwrap();
        assert_eq!(db.delete_beads_by_project("proj").await.unwrap(), 2);
        assert!(db.list_beads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_roundtrip() {
        let db = CacheDb::new_in_memory().await.unwrap();
        let agent = Agent::new(
            "agent-1",
            "ada",
            "engineer",
            Persona {
                name: "ada".into(),
                body: "You are Ada.".into(),
            },
            "proj",
        );
        db.upsert_agent(&agent).await.unwrap();
        let agents = db.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].persona.body, "You are Ada.");
        assert_eq!(agents[0].status, AgentStatus::Paused);

        db.delete_agent("agent-1").await.unwrap();
        assert!(db.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_roundtrip() {
        let db = CacheDb::new_in_memory().await.unwrap();
        let provider = Provider {
            id: "prov-1".into(),
            provider_type: ProviderType::OpenaiLike,
            endpoint: "http://localhost:8000".into(),
            key_ref: Some("LLM_KEY".into()),
            configured_model: "m1".into(),
            selected_model: None,
            status: ProviderStatus::Pending,
            last_heartbeat: None,
        };
        db.upsert_provider(&provider).await.unwrap();
        let providers = db.list_providers().await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].key_ref.as_deref(), Some("LLM_KEY"));
    }

    #[tokio::test]
    async fn request_log_counts() {
        let db = CacheDb::new_in_memory().await.unwrap();
        db.log_request(
            "r1",
            "chat",
            Some("agent-1"),
            Some("proj-1"),
            Some("proj"),
            "{}",
            42,
            true,
        )
        .await
        .unwrap();
        db.log_request("r2", "shell", None, None, None, "{}", 7, false)
            .await
            .unwrap();
        assert_eq!(db.count_requests("chat").await.unwrap(), 1);
        assert_eq!(db.count_requests("shell").await.unwrap(), 1);
        assert_eq!(db.count_requests("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn project_roundtrip() {
        let db = CacheDb::new_in_memory().await.unwrap();
        db.upsert_project("alpha", "{\"id\":\"alpha\"}").await.unwrap();
        let projects = db.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].0, "alpha");
    }
}
