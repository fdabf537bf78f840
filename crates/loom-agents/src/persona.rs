//! Personas and the org chart.
//!
//! A persona is a display name plus the prompt body injected as the system
//! message. The org chart names the positions every project must keep
//! staffed; vacant positions get a paused agent at startup.

use loom_core::types::Persona;

/// Positions that must always have an agent, even a paused one.
pub const REQUIRED_POSITIONS: &[&str] = &["ceo", "engineering_lead"];

/// Positions filled opportunistically when providers are plentiful.
pub const OPTIONAL_POSITIONS: &[&str] = &["engineer", "reviewer", "researcher"];

pub fn is_required_position(position: &str) -> bool {
    REQUIRED_POSITIONS.contains(&position)
}

/// Default persona for an org-chart position.
pub fn default_persona(position: &str) -> Persona {
    let (name, body) = match position {
        "ceo" => (
            "CEO",
            "You are the CEO. You resolve escalated decisions: approve, deny, \
             or request more information. Be decisive and brief.",
        ),
        "engineering_lead" => (
            "Engineering Lead",
            "You are the engineering lead. You break epics into tasks, wire \
             dependencies, and escalate anything requiring budget or policy \
             approval.",
        ),
        "reviewer" => (
            "Reviewer",
            "You review completed work for correctness before it is closed.",
        ),
        "researcher" => (
            "Researcher",
            "You investigate open questions and attach findings as bead context.",
        ),
        _ => (
            "Engineer",
            "You are a software engineer. You pick up tasks, emit structured \
             actions, and signal done when the task is complete.",
        ),
    };
    Persona {
        name: name.to_string(),
        body: body.to_string(),
    }
}

/// The role string recorded on agents created for a position.
pub fn role_for_position(position: &str) -> &str {
    match position {
        "ceo" => "executive",
        "engineering_lead" => "lead",
        "reviewer" => "reviewer",
        "researcher" => "researcher",
        _ => "engineer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_positions_are_recognized() {
        assert!(is_required_position("ceo"));
        assert!(is_required_position("engineering_lead"));
        assert!(!is_required_position("engineer"));
    }

    #[test]
    fn every_position_has_a_persona() {
        for position in REQUIRED_POSITIONS.iter().chain(OPTIONAL_POSITIONS) {
            let persona = default_persona(position);
            assert!(!persona.name.is_empty());
            assert!(!persona.body.is_empty());
        }
    }
}
