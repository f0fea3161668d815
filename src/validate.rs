//! Request validation. Nothing is allocated for execution until a request
//! has been turned into [`ValidatedCode`] here.

use std::fmt;

use serde_json::Value;

use crate::sandbox::policy::CapabilityPolicy;

/// An incoming execution request. `code` is whatever the caller sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionRequest {
    pub code: Option<Value>,
}

impl ExecutionRequest {
    /// Build a request from a JSON body. Bodies that are not objects simply
    /// have no `code` field.
    pub fn from_json(body: &Value) -> Self {
        Self {
            code: body.get("code").cloned(),
        }
    }

    pub fn from_code(code: impl Into<String>) -> Self {
        Self {
            code: Some(Value::String(code.into())),
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Missing,
    WrongType,
    Empty,
    TooLong { max: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Missing => f.write_str("No code provided"),
            Rejection::WrongType => f.write_str("Code must be a string"),
            Rejection::Empty => f.write_str("Empty code provided"),
            Rejection::TooLong { max } => {
                write!(f, "Code exceeds maximum length of {} characters", max)
            }
        }
    }
}

impl std::error::Error for Rejection {}

/// Snippet source that passed validation. Only [`validate`] can build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCode(String);

impl ValidatedCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Check a request against the policy. The first failing check wins.
pub fn validate(
    request: &ExecutionRequest,
    policy: &CapabilityPolicy,
) -> Result<ValidatedCode, Rejection> {
    let code = match &request.code {
        None | Some(Value::Null) => return Err(Rejection::Missing),
        Some(Value::String(code)) => code,
        Some(_) => return Err(Rejection::WrongType),
    };

    let trimmed = code.trim();
    if trimmed.is_empty() {
        return Err(Rejection::Empty);
    }
    if trimmed.chars().count() > policy.max_code_length {
        return Err(Rejection::TooLong {
            max: policy.max_code_length,
        });
    }

    Ok(ValidatedCode(code.clone()))
}
