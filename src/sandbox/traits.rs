use async_trait::async_trait;

use crate::sandbox::ExecutionOutcome;
use crate::validate::{validate, ExecutionRequest, ValidatedCode};

/// Capability flags indicating what the backend supports
#[derive(Debug, Clone, Default)]
pub struct BackendCapabilities {
    /// Snippets can reach the network through `fetch`
    pub networking: bool,
    /// Non-yielding code can be stopped from outside
    pub preemptive: bool,
}

/// Trait for snippet execution backends.
///
/// Every call gets a fresh execution context. Implementations must turn every
/// failure into an [`ExecutionOutcome`] rather than returning early, and must
/// not return before the execution unit has been stopped.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Returns the backend name (e.g., "v8")
    fn name(&self) -> &str;

    /// Returns the capabilities of this backend
    fn capabilities(&self) -> BackendCapabilities;

    /// Execute one validated snippet
    async fn execute(&self, code: ValidatedCode) -> ExecutionOutcome;

    /// Check if the backend can build a context and run a trivial snippet.
    async fn health_check(&self) -> bool {
        let request = ExecutionRequest::from_code("1 + 1");
        let Ok(code) = validate(&request, &Default::default()) else {
            return false;
        };
        matches!(self.execute(code).await, ExecutionOutcome::Completed { .. })
    }
}
