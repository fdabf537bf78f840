//! Per-bead workflow engine.
//!
//! A workflow is a DAG of named nodes joined by edges labeled with a
//! condition. An execution tracks one bead's position in the graph;
//! `advance` records the current node's completion and follows the edge
//! matching the reported condition. Several matching edges resolve by
//! priority; a priority tie is a configuration error. No matching edge
//! terminates the execution.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::actions::WorkflowCondition;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("unknown node {node} in workflow {workflow}")]
    UnknownNode { workflow: String, node: String },
    #[error("workflow {workflow}: ambiguous edges from {node} on {condition} (equal priority)")]
    AmbiguousEdges {
        workflow: String,
        node: String,
        condition: WorkflowCondition,
    },
    #[error("execution {0} is already terminal")]
    AlreadyTerminal(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    pub condition: WorkflowCondition,
    /// Higher wins when several edges match a condition.
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct WorkflowDef {
    pub id: String,
    pub entry: String,
    pub nodes: Vec<String>,
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowDef {
    /// Pick the outgoing edge for a condition. `None` means terminal.
    fn next(&self, node: &str, condition: WorkflowCondition) -> Result<Option<&WorkflowEdge>> {
        let mut matching: Vec<&WorkflowEdge> = self
            .edges
            .iter()
            .filter(|e| e.from == node && e.condition == condition)
            .collect();
        matching.sort_by_key(|e| std::cmp::Reverse(e.priority));
        match matching.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(single)),
            [first, second, ..] if first.priority == second.priority => {
                Err(WorkflowError::AmbiguousEdges {
                    workflow: self.id.clone(),
                    node: node.to_string(),
                    condition,
                })
            }
            [first, ..] => Ok(Some(first)),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeCompletion {
    pub node: String,
    pub condition: WorkflowCondition,
    pub agent_id: String,
    pub result: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub bead_id: String,
    pub current_node: String,
    pub terminal: bool,
    pub history: Vec<NodeCompletion>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    workflows: Mutex<HashMap<String, WorkflowDef>>,
    executions: Mutex<HashMap<String, WorkflowExecution>>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, def: WorkflowDef) {
        let mut workflows = self.workflows.lock().expect("workflow lock poisoned");
        workflows.insert(def.id.clone(), def);
    }

    /// Start an execution for a bead at the workflow's entry node.
    pub fn start(&self, workflow_id: &str, bead_id: &str) -> Result<WorkflowExecution> {
        let entry = {
            let workflows = self.workflows.lock().expect("workflow lock poisoned");
            let def = workflows
                .get(workflow_id)
                .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
            def.entry.clone()
        };
        let execution = WorkflowExecution {
            id: format!("wfx-{}", uuid::Uuid::new_v4()),
            workflow_id: workflow_id.to_string(),
            bead_id: bead_id.to_string(),
            current_node: entry,
            terminal: false,
            history: Vec::new(),
        };
        let mut executions = self.executions.lock().expect("workflow lock poisoned");
        executions.insert(execution.id.clone(), execution.clone());
        debug!(execution = %execution.id, workflow = %workflow_id, bead_id = %bead_id, "workflow started");
        Ok(execution)
    }

    pub fn get(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let executions = self.executions.lock().expect("workflow lock poisoned");
        executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))
    }

    pub fn execution_for_bead(&self, bead_id: &str) -> Option<WorkflowExecution> {
        let executions = self.executions.lock().expect("workflow lock poisoned");
        executions
            .values()
            .find(|e| e.bead_id == bead_id && !e.terminal)
            .cloned()
    }

    /// Record completion of the current node and follow the matching edge.
    /// Returns the updated execution; `terminal` is set when no edge
    /// matches the condition.
    pub fn advance(
        &self,
        execution_id: &str,
        condition: WorkflowCondition,
        agent_id: &str,
        result: Value,
    ) -> Result<WorkflowExecution> {
        let workflows = self.workflows.lock().expect("workflow lock poisoned");
        let mut executions = self.executions.lock().expect("workflow lock poisoned");

        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        if execution.terminal {
            return Err(WorkflowError::AlreadyTerminal(execution_id.to_string()));
        }
        let def = workflows
            .get(&execution.workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(execution.workflow_id.clone()))?;
        if !def.nodes.contains(&execution.current_node) {
            return Err(WorkflowError::UnknownNode {
                workflow: def.id.clone(),
                node: execution.current_node.clone(),
            });
        }

        let next = def.next(&execution.current_node, condition)?;
        execution.history.push(NodeCompletion {
            node: execution.current_node.clone(),
            condition,
            agent_id: agent_id.to_string(),
            result,
            at: Utc::now(),
        });
        match next {
            Some(edge) => {
                execution.current_node = edge.to.clone();
                debug!(
                    execution = %execution_id,
                    node = %edge.to,
                    condition = %condition,
                    "workflow advanced"
                );
            }
            None => {
                execution.terminal = true;
                info!(execution = %execution_id, condition = %condition, "workflow terminal");
            }
        }
        Ok(execution.clone())
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review_workflow() -> WorkflowDef {
        WorkflowDef {
            id: "review".into(),
            entry: "implement".into(),
            nodes: vec!["implement".into(), "review".into(), "fix".into()],
            edges: vec![
                WorkflowEdge {
                    from: "implement".into(),
                    to: "review".into(),
                    condition: WorkflowCondition::Success,
                    priority: 0,
                },
                WorkflowEdge {
                    from: "review".into(),
                    to: "fix".into(),
                    condition: WorkflowCondition::Rejected,
                    priority: 0,
                },
                WorkflowEdge {
                    from: "fix".into(),
                    to: "review".into(),
                    condition: WorkflowCondition::Success,
                    priority: 0,
                },
            ],
        }
    }

    fn engine() -> WorkflowEngine {
        let engine = WorkflowEngine::new();
        engine.register(review_workflow());
        engine
    }

    #[test]
    fn advance_follows_condition_edges() {
        let engine = engine();
        let execution = engine.start("review", "p-1").unwrap();
        assert_eq!(execution.current_node, "implement");

        let execution = engine
            .advance(&execution.id, WorkflowCondition::Success, "agent-1", json!({}))
            .unwrap();
        assert_eq!(execution.current_node, "review");
        assert!(!execution.terminal);
        assert_eq!(execution.history.len(), 1);
        assert_eq!(execution.history[0].node, "implement");
    }

    #[test]
    fn no_matching_edge_is_terminal() {
        let engine = engine();
        let execution = engine.start("review", "p-1").unwrap();
        engine
            .advance(&execution.id, WorkflowCondition::Success, "agent-1", json!({}))
            .unwrap();
        // "review" has no edge for approved.
        let done = engine
            .advance(&execution.id, WorkflowCondition::Approved, "agent-1", json!({}))
            .unwrap();
        assert!(done.terminal);

        let err = engine
            .advance(&execution.id, WorkflowCondition::Success, "agent-1", json!({}))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyTerminal(_)));
    }

    #[test]
    fn priority_breaks_multi_edge_matches() {
        let engine = WorkflowEngine::new();
        let mut def = review_workflow();
        def.edges.push(WorkflowEdge {
            from: "implement".into(),
            to: "fix".into(),
            condition: WorkflowCondition::Success,
            priority: 10,
        });
        engine.register(def);

        let execution = engine.start("review", "p-1").unwrap();
        let advanced = engine
            .advance(&execution.id, WorkflowCondition::Success, "agent-1", json!({}))
            .unwrap();
        assert_eq!(advanced.current_node, "fix");
    }

    #[test]
    fn equal_priority_is_a_configuration_error() {
        let engine = WorkflowEngine::new();
        let mut def = review_workflow();
        def.edges.push(WorkflowEdge {
            from: "implement".into(),
            to: "fix".into(),
            condition: WorkflowCondition::Success,
            priority: 0,
        });
        engine.register(def);

        let execution = engine.start("review", "p-1").unwrap();
        let err = engine
            .advance(&execution.id, WorkflowCondition::Success, "agent-1", json!({}))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AmbiguousEdges { .. }));
    }

    #[test]
    fn execution_lookup_by_bead() {
        let engine = engine();
        let execution = engine.start("review", "p-9").unwrap();
        let found = engine.execution_for_bead("p-9").unwrap();
        assert_eq!(found.id, execution.id);
        assert!(engine.execution_for_bead("p-404").is_none());
    }

    #[test]
    fn unknown_workflow_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.start("ghost", "p-1"),
            Err(WorkflowError::WorkflowNotFound(_))
        ));
    }
}
