//! Execution plane: action decoding and routing, readiness gating, shell
//! delegation, workflows, and the per-project executor loop.

pub mod actions;
pub mod executor;
pub mod readiness;
pub mod router;
pub mod shell;
pub mod workflow;

pub use actions::{decode_envelope, Action, DecodeError, Decoded, WorkflowCondition};
pub use executor::{ExecutorConfig, TaskExecutor};
pub use readiness::{GitAuthProbe, ReadinessChecker, ReadinessReport};
pub use router::{ActionOutcome, ActionRouter, OutcomeStatus, RouteReport, RouteScope};
pub use shell::{ProcessShellRunner, ShellRequest, ShellResult, ShellRunner};
pub use workflow::{WorkflowDef, WorkflowEdge, WorkflowEngine, WorkflowExecution};
