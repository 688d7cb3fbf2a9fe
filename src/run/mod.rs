//! Run lifecycle: phase machine, orchestration and the values it exchanges
//! with callers.

pub mod errors;
pub mod operation;
pub mod orchestrator;
pub mod outcome;
pub mod package;
pub mod poll;
pub mod state_machine;

pub use errors::{ErrorKind, RunError};
pub use operation::{Operation, OperationKind};
pub use orchestrator::{OrchestratorSettings, RunOrchestrator};
pub use outcome::{DiscardReason, RunOutcome, RunReport};
pub use package::{ConfigurationSnapshot, PackageError};
pub use poll::PollPolicy;
pub use state_machine::{RunEvent, RunLifecycle, RunPhase, TransitionError};
