//! Startup recovery for agents and beads.
//!
//! After a crash, agents can be left in `working` and beads in
//! `in_progress` assigned to ephemeral executor IDs that no longer exist.
//! Recovery runs once during initialization, before any executor starts.

use std::sync::Arc;

use loom_core::types::{AgentStatus, BeadStatus};
use loom_store::store::{BeadFilter, BeadPatch, BeadStore};
use tracing::{info, warn};

use crate::manager::AgentManager;

/// Prefix used for ephemeral executor claim IDs. An `in_progress` bead
/// assigned to one of these after a restart is a zombie.
pub const EPHEMERAL_PREFIX: &str = "exec-";

#[derive(Debug, Default, PartialEq)]
pub struct RecoveryReport {
    pub agents_reset: usize,
    pub beads_reset: usize,
}

/// Reset agents left `working` and return zombie beads to the open pool.
///
/// A bead counts as a zombie when it is `in_progress` and its assignee is
/// either an ephemeral executor ID or absent from the live agent set.
pub async fn recover_on_boot(
    agents: &AgentManager,
    store: &Arc<BeadStore>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    for agent in agents.list() {
        if agent.status == AgentStatus::Working {
            match agents.update_status(&agent.id, AgentStatus::Idle).await {
                Ok(_) => {
                    report.agents_reset += 1;
                    info!(agent = %agent.id, "boot recovery: working agent reset to idle");
                }
                Err(e) => warn!(agent = %agent.id, error = %e, "boot recovery: agent reset failed"),
            }
        }
    }

    let in_progress = store.list_by_filter(&BeadFilter {
        status: Some(BeadStatus::InProgress),
        ..Default::default()
    });
    for bead in in_progress {
        let zombie = bead.assigned_to.starts_with(EPHEMERAL_PREFIX)
            || bead.assigned_to.is_empty()
            || !agents.exists(&bead.assigned_to);
        if !zombie {
            continue;
        }
        let patch = BeadPatch::status(BeadStatus::Open).with_assignee("");
        match store.update(&bead.id, patch).await {
            Ok(_) => {
                report.beads_reset += 1;
                info!(bead_id = %bead.id, was_assigned = %bead.assigned_to, "boot recovery: zombie bead reopened");
            }
            Err(e) => warn!(bead_id = %bead.id, error = %e, "boot recovery: bead reset failed"),
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
