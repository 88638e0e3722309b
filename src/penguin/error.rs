//! Crate-wide error taxonomy.
//!
//! Follows the teacher's convention of a small hand-written enum per concern
//! with a manual `Display` and `std::error::Error` impl rather than a derive
//! macro. [`PenguinError`] unifies the eight categories from the error handling
//! design so [`crate::penguin::orchestrator::Orchestrator::process`] can return a
//! single structured error type to callers.

use std::fmt;

/// Top-level error taxonomy. Variant order matches the numbered categories in
/// the error handling design.
#[derive(Debug)]
pub enum PenguinError {
    /// 1. Fatal at startup: invalid budgets, unknown provider, unreadable workspace.
    Configuration(String),
    /// 2. Retryable: 4xx/5xx from the model provider.
    Provider(String),
    /// 3. Recoverable: empty or trivially short model output.
    EmptyResponse,
    /// 4. Recoverable: malformed action tag in assistant text.
    Parse(String),
    /// 5. Surfaced: an action was denied by the permission engine.
    PermissionDenied { operation: String, resource: String, rationale: String },
    /// 6. Surfaced: a tool handler returned or raised an error.
    ToolExecution { action_name: String, message: String },
    /// 7. Degraded: a session store write failed but in-memory state is intact.
    Persistence(String),
    /// 8. Clean: the run was cancelled via a control message.
    Cancelled,
}

impl fmt::Display for PenguinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PenguinError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            PenguinError::Provider(msg) => write!(f, "provider error: {msg}"),
            PenguinError::EmptyResponse => write!(f, "empty response from model"),
            PenguinError::Parse(msg) => write!(f, "action parse error: {msg}"),
            PenguinError::PermissionDenied { operation, resource, rationale } => write!(
                f,
                "permission denied for {operation} on {resource}: {rationale}"
            ),
            PenguinError::ToolExecution { action_name, message } => {
                write!(f, "tool '{action_name}' failed: {message}")
            }
            PenguinError::Persistence(msg) => write!(f, "persistence error: {msg}"),
            PenguinError::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for PenguinError {}

/// Process exit codes, per the external interfaces contract.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const UNHANDLED_ERROR: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
    pub const CANCELLED: i32 = 130;
}

impl PenguinError {
    /// Maps this error onto the process exit codes used by the CLI front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            PenguinError::Configuration(_) => exit_code::CONFIGURATION_ERROR,
            PenguinError::Cancelled => exit_code::CANCELLED,
            _ => exit_code::UNHANDLED_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_maps_to_exit_code_2() {
        let err = PenguinError::Configuration("bad budget".into());
        assert_eq!(err.exit_code(), exit_code::CONFIGURATION_ERROR);
    }

    #[test]
    fn cancelled_maps_to_130() {
        assert_eq!(PenguinError::Cancelled.exit_code(), 130);
    }
}
