//! Derived dependency view over a set of beads.
//!
//! The graph is rebuilt on demand from bead records; it holds IDs only and
//! never outlives the snapshot it was built from. `blocks` edges must form
//! a DAG; cycles are reported, never entered.

use std::collections::{HashMap, HashSet};

use loom_core::types::{Bead, BeadStatus};

/// Edges point from a bead to the beads it depends on.
#[derive(Debug, Default)]
pub struct WorkGraph {
    /// bead -> beads blocking it
    blocked_by: HashMap<String, Vec<String>>,
    /// bead -> child beads
    children: HashMap<String, Vec<String>>,
    statuses: HashMap<String, BeadStatus>,
}

impl WorkGraph {
    pub fn from_beads<'a>(beads: impl IntoIterator<Item = &'a Bead>) -> Self {
        let mut graph = Self::default();
        for bead in beads {
            graph
                .blocked_by
                .insert(bead.id.clone(), bead.blocked_by.clone());
            graph.children.insert(bead.id.clone(), bead.children.clone());
            graph.statuses.insert(bead.id.clone(), bead.status);
        }
        graph
    }

    pub fn contains(&self, id: &str) -> bool {
        self.statuses.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Beads directly blocking `id`. Unknown IDs yield an empty slice.
    pub fn blockers(&self, id: &str) -> &[String] {
        self.blocked_by.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when every blocker of `id` is closed (or absent from the
    /// snapshot, which counts as unresolved).
    pub fn is_unblocked(&self, id: &str) -> bool {
        self.blockers(id).iter().all(|b| {
            self.statuses
                .get(b)
                .map(BeadStatus::is_terminal)
                .unwrap_or(false)
        })
    }

    /// All beads reachable from `id` by walking `blocked_by` edges,
    /// `id` excluded.
    pub fn transitive_blockers(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.blockers(id).iter().map(String::as_str).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.blockers(next).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Whether a `blocked_by` path leads from `from` to `to`. Used to
    /// reject edges that would close a cycle.
    pub fn path_exists(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        self.transitive_blockers(to).contains(from)
    }

    /// Find one cycle in the `blocks` relation, if any. Returns the IDs on
    /// the cycle in walk order.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        fn visit(
            graph: &WorkGraph,
            id: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|p| p == id).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                None => {}
            }
            marks.insert(id.to_string(), Mark::InProgress);
            path.push(id.to_string());
            for blocker in graph.blockers(id) {
                if let Some(cycle) = visit(graph, blocker, marks, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            marks.insert(id.to_string(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        for id in self.statuses.keys() {
            if let Some(cycle) = visit(self, id, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Beads in dependency order: blockers before the beads they block.
    /// Beads on a cycle are omitted.
    pub fn topological_order(&self) -> Vec<String> {
        let mut indegree: HashMap<&str, usize> = self
            .statuses
            .keys()
            .map(|id| (id.as_str(), 0))
            .collect();
        // indegree of X = number of in-snapshot blockers X waits on
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, blockers) in &self.blocked_by {
            for blocker in blockers {
                if indegree.contains_key(blocker.as_str()) {
                    dependents
                        .entry(blocker.as_str())
                        .or_default()
                        .push(id.as_str());
                    *indegree.get_mut(id.as_str()).expect("known id") += 1;
                }
            }
        }

        let mut queue: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        queue.sort_unstable();

        let mut order = Vec::with_capacity(self.statuses.len());
        while let Some(id) = queue.pop() {
            order.push(id.to_string());
            if let Some(deps) = dependents.get(id) {
                for dep in deps {
                    let d = indegree.get_mut(dep).expect("known id");
                    *d -= 1;
                    if *d == 0 {
                        queue.push(dep);
                    }
                }
            }
        }
        order
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::types::{BeadType, Priority};

    fn bead(id: &str, blocked_by: &[&str]) -> Bead {
        let mut b = Bead::new(id, id, "", Priority::P2, BeadType::Task, "p");
        b.blocked_by = blocked_by.iter().map(|s| s.to_string()).collect();
        if !b.blocked_by.is_empty() {
            b.status = BeadStatus::Blocked;
        }
        b
    }

    #[test]
    fn unblocked_requires_closed_blockers() {
        let mut blocker = bead("p-1", &[]);
        let dependent = bead("p-2", &["p-1"]);
        let graph = WorkGraph::from_beads([&blocker, &dependent]);
        assert!(graph.is_unblocked("p-1"));
        assert!(!graph.is_unblocked("p-2"));

        blocker.status = BeadStatus::Closed;
        let graph = WorkGraph::from_beads([&blocker, &dependent]);
        assert!(graph.is_unblocked("p-2"));
    }

    #[test]
    fn missing_blocker_counts_as_unresolved() {
        let dependent = bead("p-2", &["gone"]);
        let graph = WorkGraph::from_beads([&dependent]);
        assert!(!graph.is_unblocked("p-2"));
    }

    #[test]
    fn transitive_blockers_walks_chains() {
        let a = bead("a", &[]);
        let b = bead("b", &["a"]);
        let c = bead("c", &["b"]);
        let graph = WorkGraph::from_beads([&a, &b, &c]);
        let blockers = graph.transitive_blockers("c");
        assert!(blockers.contains("a"));
        assert!(blockers.contains("b"));
        assert!(!blockers.contains("c"));
        assert!(graph.path_exists("a", "c"));
        assert!(!graph.path_exists("c", "a"));
    }

    #[test]
    fn cycle_detection() {
        let a = bead("a", &["c"]);
        let b = bead("b", &["a"]);
        let c = bead("c", &["b"]);
        let graph = WorkGraph::from_beads([&a, &b, &c]);
        let cycle = graph.find_cycle().expect("cycle exists");
        assert_eq!(cycle.len(), 3);

        let clean = WorkGraph::from_beads([&bead("x", &[]), &bead("y", &["x"])]);
        assert!(clean.find_cycle().is_none());
    }

    #[test]
    fn topological_order_puts_blockers_first() {
        let a = bead("a", &[]);
        let b = bead("b", &["a"]);
        let c = bead("c", &["a", "b"]);
        let graph = WorkGraph::from_beads([&a, &b, &c]);
        let order = graph.topological_order();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }
}
