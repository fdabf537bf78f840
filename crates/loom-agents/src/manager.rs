//! Agent lifecycle management.
//!
//! One mutex guards the agents map; every status write goes through it.
//! Transitions: paused -> idle when a healthy provider attaches, idle ->
//! working on bead assignment, working -> idle on close or reset. Paused is
//! the only state an agent may hold without a usable provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use loom_bus::EventBus;
use loom_core::cache::CacheDb;
use loom_core::types::{Agent, AgentStatus, Event, Persona};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("invalid transition for agent {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    #[error("transient agent store error: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

pub struct AgentManager {
    agents: Mutex<HashMap<String, Agent>>,
    cache: Arc<CacheDb>,
    bus: EventBus,
}

impl AgentManager {
    pub fn new(cache: Arc<CacheDb>, bus: EventBus) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            cache,
            bus,
        }
    }

    pub async fn load_from_cache(&self) -> Result<usize> {
        let records = self
            .cache
            .list_agents()
            .await
            .map_err(|e| AgentError::Transient(e.to_string()))?;
        let count = records.len();
        let mut agents = self.agents.lock().expect("agents lock poisoned");
        for agent in records {
            agents.insert(agent.id.clone(), agent);
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Create a new agent. It starts paused until a provider attaches.
    pub async fn create(
        &self,
        name: impl Into<String>,
        persona: Persona,
        project_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<Agent> {
        let id = format!("agent-{}", uuid::Uuid::new_v4());
        let agent = Agent::new(id, name, role, persona, project_id);
        {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            agents.insert(agent.id.clone(), agent.clone());
        }
        self.persist(&agent).await?;
        info!(agent = %agent.id, role = %agent.role, "agent created");
        self.bus.publish(
            Event::new("agent_created", "agent_manager")
                .with_project(&agent.project_id)
                .with_data("agent_id", &agent.id),
        );
        Ok(agent)
    }

    /// Create a paused agent staffing an org-chart position.
    pub async fn create_for_position(
        &self,
        position: &str,
        persona: Persona,
        project_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<Agent> {
        let id = format!("agent-{}", uuid::Uuid::new_v4());
        let name = persona.name.clone();
        let mut agent = Agent::new(id, name, role, persona, project_id);
        agent.org_position = Some(position.to_string());
        {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            agents.insert(agent.id.clone(), agent.clone());
        }
        self.persist(&agent).await?;
        info!(agent = %agent.id, position = %position, "position staffed");
        self.bus.publish(
            Event::new("agent_created", "agent_manager")
                .with_project(&agent.project_id)
                .with_data("agent_id", &agent.id),
        );
        Ok(agent)
    }

    /// Agents staffing a given org-chart position within a project.
    pub fn get_by_position(&self, project_id: &str, position: &str) -> Vec<Agent> {
        let agents = self.agents.lock().expect("agents lock poisoned");
        agents
            .values()
            .filter(|a| a.project_id == project_id && a.org_position.as_deref() == Some(position))
            .cloned()
            .collect()
    }

    /// Bring a restored or newly created agent into service. Idempotent:
    /// restoring an agent that is already in its resting state is a no-op.
    /// A provider reference moves paused agents to idle.
    pub async fn restore(&self, id: &str, provider_id: Option<String>) -> Result<Agent> {
        let updated = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
            if let Some(provider) = provider_id {
                agent.provider_id = Some(provider);
            }
            match agent.status {
                AgentStatus::Paused if agent.provider_id.is_some() => {
                    agent.status = AgentStatus::Idle;
                }
                // Working agents without a live bead are handled by
                // recovery, not restore.
                _ => {}
            }
            agent.current_bead = None;
            agent.last_active = Utc::now();
            agent.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    pub async fn stop(&self, id: &str) -> Result<Agent> {
        let updated = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
            agent.status = AgentStatus::Paused;
            agent.current_bead = None;
            agent.clone()
        };
        self.persist(&updated).await?;
        debug!(agent = %id, "agent stopped");
        Ok(updated)
    }

    /// Permanently remove an agent record.
    pub async fn retire(&self, id: &str) -> Result<()> {
        let removed = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            agents.remove(id)
        };
        match removed {
            Some(agent) => {
                self.cache
                    .delete_agent(id)
                    .await
                    .map_err(|e| AgentError::Transient(e.to_string()))?;
                info!(agent = %id, role = %agent.role, "agent retired");
                Ok(())
            }
            None => Err(AgentError::NotFound(id.to_string())),
        }
    }

    pub async fn update_status(&self, id: &str, status: AgentStatus) -> Result<Agent> {
        let updated = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
            // Working requires a current bead; enforced by assign_bead.
            if status == AgentStatus::Working && agent.current_bead.is_none() {
                return Err(AgentError::InvalidTransition {
                    id: id.to_string(),
                    from: agent.status,
                    to: status,
                });
            }
            agent.status = status;
            if status != AgentStatus::Working && status != AgentStatus::Deciding {
                agent.current_bead = None;
            }
            agent.last_active = Utc::now();
            agent.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    pub async fn update_project(&self, id: &str, project_id: &str) -> Result<Agent> {
        let updated = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
            agent.project_id = project_id.to_string();
            agent.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Attach a provider. Paused agents with a usable provider wake to idle.
    pub async fn attach_provider(&self, id: &str, provider_id: &str) -> Result<Agent> {
        let updated = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
            agent.provider_id = Some(provider_id.to_string());
            if agent.status == AgentStatus::Paused {
                agent.status = AgentStatus::Idle;
            }
            agent.clone()
        };
        self.persist(&updated).await?;
        info!(agent = %id, provider = %provider_id, "provider attached");
        self.bus.publish(
            Event::new("agent_resumed", "agent_manager")
                .with_project(&updated.project_id)
                .with_data("agent_id", id),
        );
        Ok(updated)
    }

    /// Mark an agent working on a bead.
    pub async fn assign_bead(&self, agent_id: &str, bead_id: &str) -> Result<Agent> {
        let updated = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
            if agent.status != AgentStatus::Idle {
                return Err(AgentError::InvalidTransition {
                    id: agent_id.to_string(),
                    from: agent.status,
                    to: AgentStatus::Working,
                });
            }
            agent.status = AgentStatus::Working;
            agent.current_bead = Some(bead_id.to_string());
            agent.last_active = Utc::now();
            agent.clone()
        };
        self.persist(&updated).await?;
        self.bus.publish(
            Event::new("agent_assigned", "agent_manager")
                .with_project(&updated.project_id)
                .with_bead(bead_id)
                .with_data("agent_id", agent_id),
        );
        Ok(updated)
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        let updated = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
            agent.last_active = Utc::now();
            agent.clone()
        };
        self.persist(&updated).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<Agent> {
        let agents = self.agents.lock().expect("agents lock poisoned");
        agents
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.agents.lock().expect("agents lock poisoned").contains_key(id)
    }

    pub fn list(&self) -> Vec<Agent> {
        let agents = self.agents.lock().expect("agents lock poisoned");
        agents.values().cloned().collect()
    }

    pub fn list_by_project(&self, project_id: &str) -> Vec<Agent> {
        let agents = self.agents.lock().expect("agents lock poisoned");
        agents
            .values()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn get_idle(&self, project_id: &str) -> Vec<Agent> {
        let agents = self.agents.lock().expect("agents lock poisoned");
        agents
            .values()
            .filter(|a| a.project_id == project_id && a.status == AgentStatus::Idle)
            .cloned()
            .collect()
    }

    pub fn get_by_role(&self, role: &str) -> Vec<Agent> {
        let agents = self.agents.lock().expect("agents lock poisoned");
        agents.values().filter(|a| a.role == role).cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Stuck reset
    // -----------------------------------------------------------------------

    /// Force working agents back to idle when their `last_active` is older
    /// than the threshold, or when `bead_live` reports their current bead
    /// absent or closed. Returns how many were reset.
    pub async fn reset_stuck_agents(
        &self,
        older_than: std::time::Duration,
        bead_live: impl Fn(&str) -> bool,
    ) -> Result<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let reset: Vec<Agent> = {
            let mut agents = self.agents.lock().expect("agents lock poisoned");
            agents
                .values_mut()
                .filter(|a| {
                    a.status == AgentStatus::Working
                        && (a.last_active < cutoff
                            || a.current_bead.as_deref().map_or(true, |b| !bead_live(b)))
                })
                .map(|a| {
                    a.status = AgentStatus::Idle;
                    a.current_bead = None;
                    a.last_active = Utc::now();
                    a.clone()
                })
                .collect()
        };
        for agent in &reset {
            self.persist(agent).await?;
            info!(agent = %agent.id, "stuck agent reset to idle");
        }
        Ok(reset.len())
    }

    async fn persist(&self, agent: &Agent) -> Result<()> {
        self.cache
            .upsert_agent(agent)
            .await
            .map_err(|e| AgentError::Transient(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn manager() -> AgentManager {
        let cache = Arc::new(CacheDb::new_in_memory().await.unwrap());
        AgentManager::new(cache, EventBus::new())
    }

    fn persona() -> Persona {
        Persona {
            name: "Ada".into(),
            body: "You are Ada.".into(),
        }
    }

    #[tokio::test]
    async fn create_starts_paused() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Paused);
        assert!(agent.provider_id.is_none());
    }

    #[tokio::test]
    async fn position_agents_are_findable() {
        let mgr = manager().await;
        let agent = mgr
            .create_for_position("ceo", persona(), "p", "executive")
            .await
            .unwrap();
        assert_eq!(agent.org_position.as_deref(), Some("ceo"));
        assert_eq!(agent.status, AgentStatus::Paused);
        assert_eq!(mgr.get_by_position("p", "ceo").len(), 1);
        assert!(mgr.get_by_position("p", "engineering_lead").is_empty());
    }

    #[tokio::test]
    async fn attach_provider_wakes_paused_agent() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        let woken = mgr.attach_provider(&agent.id, "prov-1").await.unwrap();
        assert_eq!(woken.status, AgentStatus::Idle);
        assert_eq!(woken.provider_id.as_deref(), Some("prov-1"));
    }

    #[tokio::test]
    async fn assign_requires_idle() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        // Still paused.
        let err = mgr.assign_bead(&agent.id, "p-1").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidTransition { .. }));

        mgr.attach_provider(&agent.id, "prov-1").await.unwrap();
        let working = mgr.assign_bead(&agent.id, "p-1").await.unwrap();
        assert_eq!(working.status, AgentStatus::Working);
        assert_eq!(working.current_bead.as_deref(), Some("p-1"));
    }

    #[tokio::test]
    async fn status_back_to_idle_clears_bead() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        mgr.attach_provider(&agent.id, "prov-1").await.unwrap();
        mgr.assign_bead(&agent.id, "p-1").await.unwrap();

        let idle = mgr.update_status(&agent.id, AgentStatus::Idle).await.unwrap();
        assert_eq!(idle.status, AgentStatus::Idle);
        assert!(idle.current_bead.is_none());
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();

        let first = mgr.restore(&agent.id, Some("prov-1".into())).await.unwrap();
        let second = mgr.restore(&agent.id, None).await.unwrap();
        assert_eq!(first.status, AgentStatus::Idle);
        assert_eq!(second.status, AgentStatus::Idle);
        assert_eq!(second.provider_id.as_deref(), Some("prov-1"));
    }

    #[tokio::test]
    async fn restore_without_provider_stays_paused() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        let restored = mgr.restore(&agent.id, None).await.unwrap();
        assert_eq!(restored.status, AgentStatus::Paused);
    }

    #[tokio::test]
    async fn reset_stuck_agents_by_age() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        mgr.attach_provider(&agent.id, "prov-1").await.unwrap();
        mgr.assign_bead(&agent.id, "p-1").await.unwrap();

        // Recent activity: not stuck.
        assert_eq!(
            mgr.reset_stuck_agents(Duration::from_secs(300), |_| true)
                .await
                .unwrap(),
            0
        );

        // Zero threshold treats any working agent as stuck.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mgr.reset_stuck_agents(Duration::ZERO, |_| true).await.unwrap(), 1);
        let reloaded = mgr.get(&agent.id).unwrap();
        assert_eq!(reloaded.status, AgentStatus::Idle);
        assert!(reloaded.current_bead.is_none());
    }

    #[tokio::test]
    async fn reset_stuck_agents_when_bead_absent_or_closed() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        mgr.attach_provider(&agent.id, "prov-1").await.unwrap();
        mgr.assign_bead(&agent.id, "p-1").await.unwrap();

        // Fresh activity, live bead: untouched.
        assert_eq!(
            mgr.reset_stuck_agents(Duration::from_secs(300), |b| b == "p-1")
                .await
                .unwrap(),
            0
        );

        // The bead was closed out from under the agent; age no longer matters.
        assert_eq!(
            mgr.reset_stuck_agents(Duration::from_secs(300), |_| false)
                .await
                .unwrap(),
            1
        );
        let reloaded = mgr.get(&agent.id).unwrap();
        assert_eq!(reloaded.status, AgentStatus::Idle);
        assert!(reloaded.current_bead.is_none());
    }

    #[tokio::test]
    async fn queries_filter_by_project_role_and_status() {
        let mgr = manager().await;
        let a = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        let _b = mgr.create("bob", persona(), "q", "reviewer").await.unwrap();
        mgr.attach_provider(&a.id, "prov-1").await.unwrap();

        assert_eq!(mgr.list().len(), 2);
        assert_eq!(mgr.list_by_project("p").len(), 1);
        assert_eq!(mgr.get_idle("p").len(), 1);
        assert_eq!(mgr.get_idle("q").len(), 0);
        assert_eq!(mgr.get_by_role("reviewer").len(), 1);
    }

    #[tokio::test]
    async fn retire_removes_agent() {
        let mgr = manager().await;
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();
        mgr.retire(&agent.id).await.unwrap();
        assert!(!mgr.exists(&agent.id));
        assert!(matches!(
            mgr.retire(&agent.id).await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_from_cache_restores_records() {
        let cache = Arc::new(CacheDb::new_in_memory().await.unwrap());
        let mgr = AgentManager::new(Arc::clone(&cache), EventBus::new());
        let agent = mgr.create("ada", persona(), "p", "engineer").await.unwrap();

        let fresh = AgentManager::new(cache, EventBus::new());
        assert_eq!(fresh.load_from_cache().await.unwrap(), 1);
        assert_eq!(fresh.get(&agent.id).unwrap().name, "ada");
    }
}
