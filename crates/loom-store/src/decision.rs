//! Decision beads and the CEO escalation loop.
//!
//! A decision is a bead of type `Decision` carrying question/options data.
//! Creating one blocks its parent (and anything else wired to it with a
//! `blocks` edge); resolving it unblocks every dependent atomically and
//! then closes the decision.

use std::sync::Arc;

use loom_core::types::{Bead, BeadStatus, BeadType, DecisionData, DependencyKind, Event, Priority};
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{BeadFilter, BeadPatch, BeadStore, StoreError};

pub const OPTION_APPROVE: &str = "approve";
pub const OPTION_DENY: &str = "deny";
pub const OPTION_NEEDS_MORE_INFO: &str = "needs_more_info";

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("not a decision bead: {0}")]
    NotADecision(String),
    #[error("decision {0} is already resolved")]
    AlreadyResolved(String),
    /// The decision was made but some dependents failed to unblock.
    #[error("decision {id} resolved with {} unblock failures", failures.len())]
    PartialUnblock { id: String, failures: Vec<String> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, DecisionError>;

pub struct DecisionManager {
    store: Arc<BeadStore>,
    bus: loom_bus::EventBus,
}

impl DecisionManager {
    pub fn new(store: Arc<BeadStore>, bus: loom_bus::EventBus) -> Self {
        Self { store, bus }
    }

    /// File a decision bead. When a parent is given it gains a `blocks`
    /// edge from the decision and transitions to blocked.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        question: impl Into<String>,
        parent_bead: Option<&str>,
        requester: impl Into<String>,
        options: Vec<String>,
        recommendation: Option<String>,
        priority: Priority,
        project_id: &str,
    ) -> Result<Bead> {
        let question = question.into();
        let requester = requester.into();
        let bead = self
            .store
            .create(
                format!("Decision: {question}"),
                &question,
                priority,
                BeadType::Decision,
                project_id,
            )
            .await?;

        let data = DecisionData {
            question,
            options,
            recommendation,
            requested_by: requester.clone(),
            decided_by: None,
            decision: None,
            rationale: None,
        };
        let decision = self
            .store
            .update(&bead.id, BeadPatch::default().with_decision(data))
            .await?;

        if let Some(parent) = parent_bead {
            self.store
                .add_dependency(parent, &decision.id, DependencyKind::Blocks)
                .await?;
        }

        info!(bead_id = %decision.id, requester = %requester, "decision filed");
        self.bus.publish(
            Event::new("decision_created", "decision_manager")
                .with_project(project_id)
                .with_bead(&decision.id),
        );
        Ok(decision)
    }

    /// Resolve a decision: record the outcome, unblock every dependent,
    /// close the decision last so dependents never observe a closed but
    /// still-blocking decision.
    pub async fn make(
        &self,
        decision_id: &str,
        decider: &str,
        decision_text: &str,
        rationale: &str,
    ) -> Result<Bead> {
        let bead = self.store.get(decision_id)?;
        let mut data = bead
            .decision
            .clone()
            .ok_or_else(|| DecisionError::NotADecision(decision_id.to_string()))?;
        if data.decision.is_some() || bead.status.is_terminal() {
            return Err(DecisionError::AlreadyResolved(decision_id.to_string()));
        }

        data.decided_by = Some(decider.to_string());
        data.decision = Some(decision_text.to_string());
        data.rationale = Some(rationale.to_string());
        self.store
            .update(
                decision_id,
                BeadPatch::default().with_decision(data),
            )
            .await?;

        // Unblock dependents first. Best effort: collect failures, never
        // re-block on partial failure.
        let mut failures = Vec::new();
        for dependent in &bead.blocks {
            if let Err(e) = self.store.unblock(dependent, decision_id).await {
                warn!(bead_id = %dependent, decision = %decision_id, error = %e, "unblock failed");
                failures.push(dependent.clone());
            }
        }

        let closed = self
            .store
            .update(decision_id, BeadPatch::status(BeadStatus::Closed))
            .await?;

        self.bus.publish(
            Event::new("decision_made", "decision_manager")
                .with_project(&closed.project_id)
                .with_bead(decision_id)
                .with_data("decision", decision_text)
                .with_data("decided_by", decider),
        );

        if !failures.is_empty() {
            return Err(DecisionError::PartialUnblock {
                id: decision_id.to_string(),
                failures,
            });
        }
        Ok(closed)
    }

    pub fn get(&self, decision_id: &str) -> Result<Bead> {
        let bead = self.store.get(decision_id)?;
        if bead.bead_type != BeadType::Decision {
            return Err(DecisionError::NotADecision(decision_id.to_string()));
        }
        Ok(bead)
    }

    /// Unresolved decisions, most urgent first.
    pub fn get_pending(&self) -> Vec<Bead> {
        let mut pending: Vec<Bead> = self
            .store
            .list_by_filter(&BeadFilter {
                bead_type: Some(BeadType::Decision),
                ..Default::default()
            })
            .into_iter()
            .filter(|b| !b.status.is_terminal())
            .collect();
        pending.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        pending
    }

    /// Beads currently gated on a decision.
    pub fn get_blocked_beads(&self, decision_id: &str) -> Result<Vec<String>> {
        Ok(self.get(decision_id)?.blocks.clone())
    }

    // -----------------------------------------------------------------------
    // CEO escalation
    // -----------------------------------------------------------------------

    /// Escalate a bead to the CEO as a P0 decision with the fixed
    /// approve/deny/needs_more_info options. `returned_to` is the agent the
    /// bead goes back to on needs_more_info.
    pub async fn escalate_to_ceo(
        &self,
        bead_id: &str,
        reason: &str,
        returned_to: &str,
    ) -> Result<Bead> {
        let bead = self.store.get(bead_id)?;
        let decision = self
            .create(
                format!("CEO approval for {}: {reason}", bead.id),
                Some(bead_id),
                returned_to,
                vec![
                    OPTION_APPROVE.to_string(),
                    OPTION_DENY.to_string(),
                    OPTION_NEEDS_MORE_INFO.to_string(),
                ],
                None,
                Priority::P0,
                &bead.project_id,
            )
            .await?;
        // Remember where the bead returns on needs_more_info.
        self.store
            .update(
                &decision.id,
                BeadPatch::default().with_context("returned_to", returned_to),
            )
            .await?;
        Ok(decision)
    }

    /// Resolve a CEO escalation and apply the outcome to the parent bead.
    pub async fn resolve_ceo(
        &self,
        decision_id: &str,
        decider: &str,
        choice: &str,
        rationale: &str,
    ) -> Result<()> {
        let decision = self.get(decision_id)?;
        let returned_to = decision
            .context
            .get("returned_to")
            .cloned()
            .unwrap_or_default();
        // The escalated bead is the one this decision blocks.
        let parents = decision.blocks.clone();

        self.make(decision_id, decider, choice, rationale).await?;

        for parent in parents {
            match choice {
                OPTION_APPROVE => {
                    let mut patch = BeadPatch::status(BeadStatus::Closed);
                    patch.allow_open_children = true;
                    self.store.update(&parent, patch).await?;
                }
                OPTION_DENY => {
                    let patch = BeadPatch::status(BeadStatus::Open)
                        .with_assignee("")
                        .with_context("ceo_denied_at", chrono::Utc::now().to_rfc3339());
                    self.store.update(&parent, patch).await?;
                }
                OPTION_NEEDS_MORE_INFO => {
                    let patch = BeadPatch::status(BeadStatus::Open)
                        .with_assignee(returned_to.clone())
                        .with_context("redispatch_requested", "true");
                    self.store.update(&parent, patch).await?;
                }
                other => {
                    warn!(decision = %decision_id, choice = %other, "unknown CEO outcome, leaving parent as unblocked");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_bus::EventBus;
    use loom_core::cache::CacheDb;
    use loom_core::types::BeadType;

    async fn setup() -> (Arc<BeadStore>, DecisionManager) {
        let cache = Arc::new(CacheDb::new_in_memory().await.unwrap());
        let bus = EventBus::new();
        let store = Arc::new(BeadStore::new(cache, bus.clone()));
        let manager = DecisionManager::new(Arc::clone(&store), bus);
        (store, manager)
    }

    async fn task(store: &BeadStore, title: &str) -> Bead {
        store
            .create(title, "", Priority::P2, BeadType::Task, "p")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_blocks_parent() {
        let (store, manager) = setup().await;
        let parent = task(&store, "X").await;

        let decision = manager
            .create(
                "which db?",
                Some(&parent.id),
                "agent-1",
                vec!["sqlite".into(), "postgres".into()],
                Some("sqlite".into()),
                Priority::P1,
                "p",
            )
            .await
            .unwrap();

        assert_eq!(decision.bead_type, BeadType::Decision);
        let parent = store.get(&parent.id).unwrap();
        assert_eq!(parent.status, BeadStatus::Blocked);
        assert_eq!(parent.blocked_by, vec![decision.id]);
    }

    #[tokio::test]
    async fn make_unblocks_all_dependents_then_closes() {
        let (store, manager) = setup().await;
        let x = task(&store, "X").await;
        let y = task(&store, "Y").await;

        let decision = manager
            .create("go?", Some(&x.id), "agent-1", vec!["yes".into(), "no".into()], None, Priority::P1, "p")
            .await
            .unwrap();
        store
            .add_dependency(&y.id, &decision.id, DependencyKind::Blocks)
            .await
            .unwrap();

        assert_eq!(store.get(&x.id).unwrap().status, BeadStatus::Blocked);
        assert_eq!(store.get(&y.id).unwrap().status, BeadStatus::Blocked);

        manager.make(&decision.id, "user-1", "yes", "").await.unwrap();

        assert_eq!(store.get(&x.id).unwrap().status, BeadStatus::Open);
        assert_eq!(store.get(&y.id).unwrap().status, BeadStatus::Open);
        let resolved = store.get(&decision.id).unwrap();
        assert_eq!(resolved.status, BeadStatus::Closed);
        let data = resolved.decision.unwrap();
        assert_eq!(data.decision.as_deref(), Some("yes"));
        assert_eq!(data.decided_by.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn make_twice_fails() {
        let (store, manager) = setup().await;
        let _ = store;
        let decision = manager
            .create("q", None, "a", vec!["x".into()], None, Priority::P2, "p")
            .await
            .unwrap();
        manager.make(&decision.id, "u", "x", "").await.unwrap();
        let err = manager.make(&decision.id, "u", "x", "").await.unwrap_err();
        assert!(matches!(err, DecisionError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn pending_excludes_resolved_and_sorts_by_priority() {
        let (_store, manager) = setup().await;
        let low = manager
            .create("low", None, "a", vec!["x".into()], None, Priority::P3, "p")
            .await
            .unwrap();
        let urgent = manager
            .create("urgent", None, "a", vec!["x".into()], None, Priority::P0, "p")
            .await
            .unwrap();
        let done = manager
            .create("done", None, "a", vec!["x".into()], None, Priority::P1, "p")
            .await
            .unwrap();
        manager.make(&done.id, "u", "x", "").await.unwrap();

        let pending: Vec<String> = manager.get_pending().into_iter().map(|b| b.id).collect();
        assert_eq!(pending, vec![urgent.id, low.id]);
    }

    #[tokio::test]
    async fn ceo_approve_closes_parent() {
        let (store, manager) = setup().await;
        let parent = task(&store, "ship").await;
        let decision = manager
            .escalate_to_ceo(&parent.id, "budget", "agent-7")
            .await
            .unwrap();

        assert_eq!(store.get(&decision.id).unwrap().priority, Priority::P0);
        assert_eq!(store.get(&parent.id).unwrap().status, BeadStatus::Blocked);

        manager
            .resolve_ceo(&decision.id, "ceo", OPTION_APPROVE, "looks good")
            .await
            .unwrap();
        assert_eq!(store.get(&parent.id).unwrap().status, BeadStatus::Closed);
    }

    #[tokio::test]
    async fn ceo_deny_reopens_with_audit_context() {
        let (store, manager) = setup().await;
        let parent = task(&store, "ship").await;
        store.claim(&parent.id, "agent-7").await.unwrap();
        let decision = manager
            .escalate_to_ceo(&parent.id, "budget", "agent-7")
            .await
            .unwrap();

        manager
            .resolve_ceo(&decision.id, "ceo", OPTION_DENY, "too expensive")
            .await
            .unwrap();

        let parent = store.get(&parent.id).unwrap();
        assert_eq!(parent.status, BeadStatus::Open);
        assert!(!parent.is_assigned());
        assert!(parent.context.contains_key("ceo_denied_at"));
    }

    #[tokio::test]
    async fn ceo_needs_more_info_returns_to_agent() {
        let (store, manager) = setup().await;
        let parent = task(&store, "ship").await;
        let decision = manager
            .escalate_to_ceo(&parent.id, "unclear scope", "agent-7")
            .await
            .unwrap();

        manager
            .resolve_ceo(&decision.id, "ceo", OPTION_NEEDS_MORE_INFO, "what repos?")
            .await
            .unwrap();

        let parent = store.get(&parent.id).unwrap();
        assert_eq!(parent.status, BeadStatus::Open);
        assert_eq!(parent.assigned_to, "agent-7");
        assert_eq!(
            parent.context.get("redispatch_requested").map(String::as_str),
            Some("true")
        );
    }
}
