//! Result serializer: collector lines plus outcome into the external contract.
//!
//! The external result is a JSON object with either an `output` string
//! (success) or an `error` string (failure). Failures keep whatever output
//! was recorded before the failure in `output`, omitted when empty.
//!
//! ```text
//! {"output": "1\n2\nReturn value: 42"}
//! {"output": "before", "error": "Error: x"}
//! {"error": "Code execution timeout (5 seconds)"}
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sandbox::collector::CollectedOutput;
use crate::sandbox::outcome::{ErrorClass, ExecutionOutcome};
use crate::utils::text::describe_deadline;

/// Output shown when a program finished without printing or returning anything.
pub const NO_OUTPUT_MARKER: &str = "Code executed successfully (no output)";

/// Prefix of the final line carrying the program's return value.
pub const RETURN_VALUE_PREFIX: &str = "Return value: ";

/// Message shown for host-side failures. Never carries host detail.
pub const INTERNAL_FAILURE_MESSAGE: &str = "Failed to execute code";

/// The structured result handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Newline-joined output lines.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,

    /// One-line error description, present only on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Failure class, for callers that need more than the message.
    #[serde(skip)]
    pub error_class: Option<ErrorClass>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
            error_class: None,
        }
    }

    pub fn failure(output: impl Into<String>, error: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            output: output.into(),
            error: Some(error.into()),
            error_class: Some(class),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds the external result from a finished execution.
///
/// - Completed: output lines, then `Return value: ...` if there is one; the
///   no-output marker if that leaves nothing to show
/// - Thrown: the error description, with earlier output preserved
/// - Timed out: a fixed message naming the deadline
/// - Internal failure: a generic message; the reason stays in server logs
pub fn serialize(output: &CollectedOutput, outcome: &ExecutionOutcome) -> ExecutionResult {
    let printed = output.lines.join("\n");

    match outcome {
        ExecutionOutcome::Completed { return_value } => {
            let mut text = printed;
            if let Some(value) = return_value {
                if !output.lines.is_empty() {
                    text.push('\n');
                }
                text.push_str(RETURN_VALUE_PREFIX);
                text.push_str(value);
            }
            if text.is_empty() {
                text = NO_OUTPUT_MARKER.to_string();
            }
            ExecutionResult::success(text)
        }
        ExecutionOutcome::Thrown { class, message } => {
            ExecutionResult::failure(printed, single_line(message), *class)
        }
        ExecutionOutcome::TimedOut { deadline_ms } => ExecutionResult::failure(
            printed,
            timeout_message(Duration::from_millis(*deadline_ms)),
            ErrorClass::Timeout,
        ),
        ExecutionOutcome::InternalFailure { .. } => {
            ExecutionResult::failure(printed, INTERNAL_FAILURE_MESSAGE, ErrorClass::Internal)
        }
    }
}

/// Error text for a deadline overrun.
pub fn timeout_message(deadline: Duration) -> String {
    format!("Code execution timeout ({})", describe_deadline(deadline))
}

fn single_line(message: &str) -> String {
    let joined = message
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        "Uncaught exception".to_string()
    } else {
        joined
    }
}
