//! Control-plane daemon: single-instance lockfile, the orchestrator that
//! owns component lifetimes, and the maintenance ticker.

pub mod lockfile;
pub mod maintenance;
pub mod orchestrator;

pub use lockfile::DaemonLockfile;
pub use maintenance::{Maintenance, MaintenanceReport};
pub use orchestrator::Loom;
