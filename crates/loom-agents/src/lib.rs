//! Agent lifecycle: records, personas, and crash recovery.

pub mod manager;
pub mod persona;
pub mod recovery;

pub use manager::{AgentError, AgentManager};
pub use recovery::{recover_on_boot, RecoveryReport, EPHEMERAL_PREFIX};
