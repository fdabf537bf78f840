//! Durable bead work-graph: store, dependency view, federation, decisions.

pub mod decision;
pub mod federation;
pub mod store;
pub mod workgraph;

pub use decision::{DecisionError, DecisionManager};
pub use store::{BeadFilter, BeadPatch, BeadStore, StoreError};
pub use workgraph::WorkGraph;
