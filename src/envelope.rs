//! One response shape for every way a request can end.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::sandbox::ExecutionOutcome;
use crate::validate::Rejection;

/// Response data for an execution that ran. Both fields are always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub result: String,
    pub error: String,
}

impl ExecutionResult {
    pub fn new(result: impl AsRef<str>, error: impl AsRef<str>) -> Self {
        Self {
            result: result.as_ref().trim().to_string(),
            error: error.as_ref().trim().to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// A finished request, ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// The snippet ran, whatever happened inside it
    Executed(ExecutionResult),
    /// The request was refused before anything ran
    Rejected { error: String },
    /// No sandbox could be built
    SetupFailed { details: String },
}

impl Envelope {
    pub fn rejected(rejection: Rejection) -> Self {
        Envelope::Rejected {
            error: rejection.to_string(),
        }
    }

    pub fn invalid_body(reason: impl std::fmt::Display) -> Self {
        Envelope::Rejected {
            error: format!("Invalid JSON body: {}", reason),
        }
    }

    pub fn from_outcome(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Completed { output } => {
                Envelope::Executed(ExecutionResult::new(output.result, output.error))
            }
            ExecutionOutcome::ThrownError { output, message } => Envelope::Executed(
                ExecutionResult::new(output.result, append_line(&output.error, &message)),
            ),
            ExecutionOutcome::TimedOut { output, timeout } => {
                let message = format!("Execution timed out after {}ms", timeout.as_millis());
                Envelope::Executed(ExecutionResult::new(
                    output.result,
                    append_line(&output.error, &message),
                ))
            }
            ExecutionOutcome::SetupFailed { message } => Envelope::SetupFailed {
                details: message.trim().to_string(),
            },
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Envelope::Executed(_) => 200,
            Envelope::Rejected { .. } => 400,
            Envelope::SetupFailed { .. } => 500,
        }
    }

    pub fn body(&self) -> serde_json::Value {
        match self {
            Envelope::Executed(result) => json!({
                "result": result.result,
                "error": result.error,
            }),
            Envelope::Rejected { error } => json!({ "error": error }),
            Envelope::SetupFailed { details } => json!({
                "error": "Failed to initialize sandbox",
                "details": details,
            }),
        }
    }
}

fn append_line(stream: &str, line: &str) -> String {
    let stream = stream.trim_end();
    if stream.is_empty() {
        line.to_string()
    } else {
        format!("{}\n{}", stream, line)
    }
}
