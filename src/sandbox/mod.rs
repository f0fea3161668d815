mod backends;
pub mod ops;
pub mod policy;
mod traits;

use std::time::Duration;

pub use backends::V8Backend;
pub use policy::{Capability, CapabilityPolicy, SandboxBinding};
pub use traits::{BackendCapabilities, SandboxBackend};

use crate::output::CapturedOutput;

/// Terminal state of one execution. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The snippet ran to completion
    Completed { output: CapturedOutput },
    /// The snippet raised; output captured before the failure is kept
    ThrownError {
        output: CapturedOutput,
        message: String,
    },
    /// The deadline fired and the snippet was force-stopped
    TimedOut {
        output: CapturedOutput,
        timeout: Duration,
    },
    /// No execution context could be built; the snippet never ran
    SetupFailed { message: String },
}

impl ExecutionOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::ThrownError { .. } => "thrown_error",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::SetupFailed { .. } => "setup_failed",
        }
    }
}
