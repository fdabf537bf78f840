//! The bead store: durable owner of all bead records.
//!
//! All bead mutations go through here. The in-memory map is the runtime
//! source of truth; every write goes through to the SQLite mirror with a
//! bounded retry, and a bus event announces the change. Other components
//! hold bead IDs only and re-resolve through this store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loom_bus::EventBus;
use loom_core::cache::CacheDb;
use loom_core::types::{Bead, BeadStatus, BeadType, DecisionData, DependencyKind, Event, Priority};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::workgraph::WorkGraph;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bead not found: {0}")]
    NotFound(String),
    /// Claim lost to another worker. Executors skip these silently.
    #[error("bead already claimed: {id} held by {holder}")]
    AlreadyClaimed { id: String, holder: String },
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
    /// I/O against the mirror failed after retries.
    #[error("transient store error: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// BeadPatch / BeadFilter
// ---------------------------------------------------------------------------

/// Field-level patch applied by [`BeadStore::update`]. `None` leaves the
/// field untouched; `assigned_to: Some(String::new())` clears the assignee.
#[derive(Debug, Default, Clone)]
pub struct BeadPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<BeadStatus>,
    pub priority: Option<Priority>,
    pub assigned_to: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Merged into the existing context map.
    pub context: Option<HashMap<String, String>>,
    pub decision: Option<DecisionData>,
    pub due_date: Option<DateTime<Utc>>,
    /// Permit closing while children remain open.
    pub allow_open_children: bool,
}

impl BeadPatch {
    pub fn status(status: BeadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assigned_to = Some(assignee.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_decision(mut self, decision: DecisionData) -> Self {
        self.decision = Some(decision);
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct BeadFilter {
    pub project_id: Option<String>,
    pub status: Option<BeadStatus>,
    pub bead_type: Option<BeadType>,
    pub assigned_to: Option<String>,
    pub tag: Option<String>,
}

impl BeadFilter {
    fn matches(&self, bead: &Bead) -> bool {
        if let Some(p) = &self.project_id {
            if &bead.project_id != p {
                return false;
            }
        }
        if let Some(s) = &self.status {
            if &bead.status != s {
                return false;
            }
        }
        if let Some(t) = &self.bead_type {
            if &bead.bead_type != t {
                return false;
            }
        }
        if let Some(a) = &self.assigned_to {
            if &bead.assigned_to != a {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !bead.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// BeadStore
// ---------------------------------------------------------------------------

const PERSIST_RETRIES: u32 = 3;
const PERSIST_BACKOFF_BASE: Duration = Duration::from_millis(100);

pub struct BeadStore {
    beads: Mutex<HashMap<String, Bead>>,
    /// Per-project sequence for generated IDs.
    sequences: Mutex<HashMap<String, u64>>,
    cache: Arc<CacheDb>,
    bus: EventBus,
}

impl BeadStore {
    pub fn new(cache: Arc<CacheDb>, bus: EventBus) -> Self {
        Self {
            beads: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            cache,
            bus,
        }
    }

    /// Rehydrate the in-memory map from the mirror. Called once at startup.
    pub async fn load_from_cache(&self) -> Result<usize> {
        let records = self
            .cache
            .list_beads()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        let count = records.len();
        let mut beads = self.beads.lock().expect("bead map poisoned");
        let mut sequences = self.sequences.lock().expect("sequence map poisoned");
        for bead in records {
            if let Some(seq) = id_sequence(&bead.id, &bead.project_id) {
                let entry = sequences.entry(bead.project_id.clone()).or_insert(0);
                *entry = (*entry).max(seq);
            }
            beads.insert(bead.id.clone(), bead);
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Creation / lookup
    // -----------------------------------------------------------------------

    /// Create a new open bead with a project-prefixed sequential ID.
    pub async fn create(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
        bead_type: BeadType,
        project_id: impl Into<String>,
    ) -> Result<Bead> {
        let project_id = project_id.into();
        let id = self.next_id(&project_id);
        let bead = Bead::new(id, title, description, priority, bead_type, &project_id);
        self.insert(bead.clone()).await?;
        info!(bead_id = %bead.id, project = %project_id, "bead created");
        self.publish("bead_created", &bead);
        Ok(bead)
    }

    /// Insert a fully-formed bead (federation load, tests). Fails when the
    /// ID already exists.
    pub async fn insert(&self, bead: Bead) -> Result<()> {
        {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            if beads.contains_key(&bead.id) {
                return Err(StoreError::InvariantViolated(format!(
                    "duplicate bead id: {}",
                    bead.id
                )));
            }
            beads.insert(bead.id.clone(), bead.clone());
        }
        self.persist(&bead).await
    }

    pub fn get(&self, id: &str) -> Result<Bead> {
        let beads = self.beads.lock().expect("bead map poisoned");
        beads
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn list_by_filter(&self, filter: &BeadFilter) -> Vec<Bead> {
        let beads = self.beads.lock().expect("bead map poisoned");
        beads.values().filter(|b| filter.matches(b)).cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Apply a field-level patch, enforcing status invariants.
    pub async fn update(&self, id: &str, patch: BeadPatch) -> Result<Bead> {
        let updated = {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            let bead = beads
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let updated = apply_patch(&bead, patch, &beads)?;
            beads.insert(id.to_string(), updated.clone());
            updated
        };
        self.persist(&updated).await?;
        self.publish("bead_updated", &updated);
        Ok(updated)
    }

    /// Atomically claim an open, unassigned bead for `agent_id`.
    ///
    /// This is the canonical compare-and-swap: exactly one concurrent caller
    /// wins; the rest get [`StoreError::AlreadyClaimed`].
    pub async fn claim(&self, id: &str, agent_id: &str) -> Result<Bead> {
        let claimed = {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            let bead = beads
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if bead.status != BeadStatus::Open || bead.is_assigned() {
                return Err(StoreError::AlreadyClaimed {
                    id: id.to_string(),
                    holder: if bead.is_assigned() {
                        bead.assigned_to.clone()
                    } else {
                        format!("status={}", bead.status)
                    },
                });
            }
            bead.status = BeadStatus::InProgress;
            bead.assigned_to = agent_id.to_string();
            bead.touch();
            bead.clone()
        };
        self.persist(&claimed).await?;
        debug!(bead_id = %id, agent = %agent_id, "bead claimed");
        self.publish("bead_claimed", &claimed);
        Ok(claimed)
    }

    /// Return an in-progress bead to the open pool, clearing the assignee.
    /// Used by recovery and by executors that cannot serve the bead.
    pub async fn release(&self, id: &str) -> Result<Bead> {
        let released = {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            let bead = beads
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if bead.status.is_terminal() {
                return Err(StoreError::InvariantViolated(format!(
                    "cannot release closed bead {id}"
                )));
            }
            bead.status = if bead.blocked_by.is_empty() {
                BeadStatus::Open
            } else {
                BeadStatus::Blocked
            };
            bead.assigned_to.clear();
            bead.touch();
            bead.clone()
        };
        self.persist(&released).await?;
        self.publish("bead_released", &released);
        Ok(released)
    }

    /// Record a dependency edge between two beads.
    ///
    /// For `Blocks`, `from` becomes blocked by `to` and transitions to
    /// `Blocked` unless already closed.
    pub async fn add_dependency(
        &self,
        from: &str,
        to: &str,
        kind: DependencyKind,
    ) -> Result<()> {
        let (from_bead, to_bead) = {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            if !beads.contains_key(to) {
                return Err(StoreError::NotFound(to.to_string()));
            }
            if from == to {
                return Err(StoreError::InvariantViolated(
                    "bead cannot depend on itself".into(),
                ));
            }

            // Reject blocks edges that would close a cycle.
            if kind == DependencyKind::Blocks {
                let graph = WorkGraph::from_beads(beads.values());
                if graph.path_exists(from, to) {
                    return Err(StoreError::InvariantViolated(format!(
                        "blocks edge {to} -> {from} would create a cycle"
                    )));
                }
            }

            let from_bead = {
                let bead = beads
                    .get_mut(from)
                    .ok_or_else(|| StoreError::NotFound(from.to_string()))?;
                match kind {
                    DependencyKind::Blocks => {
                        if !bead.blocked_by.contains(&to.to_string()) {
                            bead.blocked_by.push(to.to_string());
                        }
                        if !bead.status.is_terminal() {
                            bead.status = BeadStatus::Blocked;
                        }
                    }
                    DependencyKind::RelatedTo => {
                        if !bead.related_to.contains(&to.to_string()) {
                            bead.related_to.push(to.to_string());
                        }
                    }
                    DependencyKind::Parent => {
                        bead.parent = Some(to.to_string());
                    }
                }
                bead.touch();
                bead.clone()
            };

            let to_bead = {
                let bead = beads.get_mut(to).expect("checked above");
                match kind {
                    DependencyKind::Blocks => {
                        if !bead.blocks.contains(&from.to_string()) {
                            bead.blocks.push(from.to_string());
                        }
                    }
                    DependencyKind::RelatedTo => {
                        if !bead.related_to.contains(&from.to_string()) {
                            bead.related_to.push(from.to_string());
                        }
                    }
                    DependencyKind::Parent => {
                        if !bead.children.contains(&from.to_string()) {
                            bead.children.push(from.to_string());
                        }
                    }
                }
                bead.touch();
                bead.clone()
            };
            (from_bead, to_bead)
        };
        self.persist(&from_bead).await?;
        self.persist(&to_bead).await?;
        self.publish("dependency_added", &from_bead);
        Ok(())
    }

    /// Remove one blocker; transition to `Open` when no blockers remain.
    pub async fn unblock(&self, bead_id: &str, blocker_id: &str) -> Result<Bead> {
        let unblocked = {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            let bead = beads
                .get_mut(bead_id)
                .ok_or_else(|| StoreError::NotFound(bead_id.to_string()))?;
            bead.blocked_by.retain(|b| b != blocker_id);
            if bead.blocked_by.is_empty() && bead.status == BeadStatus::Blocked {
                bead.status = BeadStatus::Open;
            }
            bead.touch();
            bead.clone()
        };
        self.persist(&unblocked).await?;
        self.publish("bead_unblocked", &unblocked);
        Ok(unblocked)
    }

    // -----------------------------------------------------------------------
    // Dispatch queries
    // -----------------------------------------------------------------------

    /// Open, dispatchable beads for a project in dispatch order: priority
    /// ascending (P0 first), then created_at, then ID. Decision beads are
    /// excluded; they route to humans.
    pub fn get_ready(&self, project_id: &str) -> Vec<Bead> {
        let beads = self.beads.lock().expect("bead map poisoned");
        let mut ready: Vec<Bead> = beads
            .values()
            .filter(|b| {
                b.project_id == project_id
                    && b.status == BeadStatus::Open
                    && b.bead_type != BeadType::Decision
                    && b.blocked_by.iter().all(|blocker| {
                        beads
                            .get(blocker)
                            .map(|bl| bl.status.is_terminal())
                            .unwrap_or(false)
                    })
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        ready
    }

    /// Build the derived work graph over a project's beads.
    pub fn get_work_graph(&self, project_id: &str) -> WorkGraph {
        let beads = self.beads.lock().expect("bead map poisoned");
        let graph = WorkGraph::from_beads(
            beads.values().filter(|b| b.project_id == project_id),
        );
        if let Some(cycle) = graph.find_cycle() {
            warn!(project = %project_id, ?cycle, "blocks cycle detected in work graph");
        }
        graph
    }

    /// Replace a project's beads with `records` (federation refresh).
    /// Merge is last-writer-wins per bead; see [`crate::federation`].
    pub async fn replace_project(&self, project_id: &str, records: Vec<Bead>) -> Result<usize> {
        let count = records.len();
        {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            beads.retain(|_, b| b.project_id != project_id);
            let mut sequences = self.sequences.lock().expect("sequence map poisoned");
            for bead in records {
                if let Some(seq) = id_sequence(&bead.id, &bead.project_id) {
                    let entry = sequences.entry(bead.project_id.clone()).or_insert(0);
                    *entry = (*entry).max(seq);
                }
                beads.insert(bead.id.clone(), bead);
            }
        }
        // Mirror the swap.
        self.cache
            .delete_beads_by_project(project_id)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        let snapshot = self.list_by_filter(&BeadFilter {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        });
        for bead in &snapshot {
            self.persist(bead).await?;
        }
        Ok(count)
    }

    /// Drop every bead belonging to a project.
    pub async fn clear_project(&self, project_id: &str) -> Result<usize> {
        {
            let mut beads = self.beads.lock().expect("bead map poisoned");
            beads.retain(|_, b| b.project_id != project_id);
        }
        self.cache
            .delete_beads_by_project(project_id)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))
    }

    /// Snapshot of all beads for a project, unsorted.
    pub fn project_snapshot(&self, project_id: &str) -> Vec<Bead> {
        self.list_by_filter(&BeadFilter {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn next_id(&self, project_id: &str) -> String {
        let mut sequences = self.sequences.lock().expect("sequence map poisoned");
        let seq = sequences.entry(project_id.to_string()).or_insert(0);
        *seq += 1;
        format!("{project_id}-{seq}")
    }

    /// Write through to the mirror with exponential backoff on I/O errors.
    async fn persist(&self, bead: &Bead) -> Result<()> {
        let mut delay = PERSIST_BACKOFF_BASE;
        let mut last_err = None;
        for attempt in 0..=PERSIST_RETRIES {
            match self.cache.upsert_bead(bead).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e.to_string());
                    if attempt < PERSIST_RETRIES {
                        warn!(
                            bead_id = %bead.id,
                            attempt = attempt + 1,
                            "bead persist failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 4;
                    }
                }
            }
        }
        Err(StoreError::Transient(
            last_err.unwrap_or_else(|| "unknown".into()),
        ))
    }

    fn publish(&self, event_type: &str, bead: &Bead) {
        self.bus.publish(
            Event::new(event_type, "bead_store")
                .with_project(&bead.project_id)
                .with_bead(&bead.id)
                .with_data("status", bead.status.to_string()),
        );
    }
}

/// Parse the numeric suffix from `{project}-{n}` IDs.
fn id_sequence(id: &str, project_id: &str) -> Option<u64> {
    id.strip_prefix(project_id)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Apply `patch` to a copy of `bead`, enforcing invariants against the
/// full map (children checks need sibling records).
fn apply_patch(
    bead: &Bead,
    patch: BeadPatch,
    all: &HashMap<String, Bead>,
) -> Result<Bead> {
    let mut updated = bead.clone();
    let assignee_patched = patch.assigned_to.is_some();

    if let Some(title) = patch.title {
        updated.title = title;
    }
    if let Some(description) = patch.description {
        updated.description = description;
    }
    if let Some(priority) = patch.priority {
        updated.priority = priority;
    }
    if let Some(assigned_to) = patch.assigned_to {
        updated.assigned_to = assigned_to;
    }
    if let Some(tags) = patch.tags {
        updated.tags = tags;
    }
    if let Some(context) = patch.context {
        updated.context.extend(context);
    }
    if let Some(decision) = patch.decision {
        updated.decision = Some(decision);
    }
    if let Some(due_date) = patch.due_date {
        updated.due_date = Some(due_date);
    }

    if let Some(status) = patch.status {
        if !bead.status.can_transition_to(&status) {
            return Err(StoreError::InvariantViolated(format!(
                "bead {} is {} and cannot become {}",
                bead.id, bead.status, status
            )));
        }
        match status {
            BeadStatus::InProgress if updated.assigned_to.is_empty() => {
                return Err(StoreError::InvariantViolated(format!(
                    "bead {} cannot be in_progress without an assignee",
                    bead.id
                )));
            }
            BeadStatus::Blocked if updated.blocked_by.is_empty() => {
                return Err(StoreError::InvariantViolated(format!(
                    "bead {} cannot be blocked without a blocker",
                    bead.id
                )));
            }
            BeadStatus::Closed if !patch.allow_open_children => {
                let open_children: Vec<&String> = updated
                    .children
                    .iter()
                    .filter(|c| {
                        all.get(*c)
                            .map(|child| !child.status.is_terminal())
                            .unwrap_or(false)
                    })
                    .collect();
                if !open_children.is_empty() {
                    return Err(StoreError::InvariantViolated(format!(
                        "bead {} has open children: {:?}",
                        bead.id, open_children
                    )));
                }
            }
            _ => {}
        }
        updated.status = status;
        // Reopened beads lose their assignment unless the patch set one.
        if status == BeadStatus::Open && !assignee_patched {
            updated.assigned_to.clear();
        }
    }

    updated.touch();
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
