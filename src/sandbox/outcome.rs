//! Terminal outcome of one sandboxed execution.
//!
//! Running untrusted code never produces a Rust error for the caller. Syntax
//! errors, uncaught exceptions and deadline overruns are ordinary outcomes;
//! only host-side faults (the worker could not be started, crashed, or spoke
//! garbage) become [`ExecutionOutcome::InternalFailure`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Error taxonomy for failed executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The program text did not parse.
    Compile,
    /// The program raised an uncaught exception.
    Runtime,
    /// The deadline elapsed before the program finished.
    Timeout,
    /// Host-side resource or setup fault.
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Compile => "syntax",
            ErrorClass::Runtime => "runtime",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Exactly one of these is produced per execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The program ran to completion. `return_value` holds the rendering of
    /// the script's completion value, or `None` when it was `undefined`.
    Completed { return_value: Option<String> },

    /// The program failed to compile or threw. `class` is either
    /// [`ErrorClass::Compile`] or [`ErrorClass::Runtime`].
    Thrown { class: ErrorClass, message: String },

    /// The deadline elapsed and the worker was killed.
    TimedOut { deadline_ms: u64 },

    /// Host-side failure. `reason` is for server logs only.
    InternalFailure { reason: String },
}

impl ExecutionOutcome {
    pub fn completed(return_value: Option<String>) -> Self {
        ExecutionOutcome::Completed { return_value }
    }

    pub fn compile_error(message: impl Into<String>) -> Self {
        ExecutionOutcome::Thrown {
            class: ErrorClass::Compile,
            message: message.into(),
        }
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        ExecutionOutcome::Thrown {
            class: ErrorClass::Runtime,
            message: message.into(),
        }
    }

    pub fn timed_out(deadline: Duration) -> Self {
        ExecutionOutcome::TimedOut {
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        ExecutionOutcome::InternalFailure {
            reason: reason.into(),
        }
    }

    /// `None` for successful completion, otherwise the failure class.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            ExecutionOutcome::Completed { .. } => None,
            ExecutionOutcome::Thrown { class, .. } => Some(*class),
            ExecutionOutcome::TimedOut { .. } => Some(ErrorClass::Timeout),
            ExecutionOutcome::InternalFailure { .. } => Some(ErrorClass::Internal),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_class().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class_mapping() {
        assert_eq!(ExecutionOutcome::completed(None).error_class(), None);
        assert_eq!(
            ExecutionOutcome::compile_error("bad").error_class(),
            Some(ErrorClass::Compile)
        );
        assert_eq!(
            ExecutionOutcome::runtime_error("x").error_class(),
            Some(ErrorClass::Runtime)
        );
        assert_eq!(
            ExecutionOutcome::timed_out(Duration::from_secs(5)).error_class(),
            Some(ErrorClass::Timeout)
        );
        assert_eq!(
            ExecutionOutcome::internal("spawn failed").error_class(),
            Some(ErrorClass::Internal)
        );
    }

    #[test]
    fn test_timed_out_records_millis() {
        assert_eq!(
            ExecutionOutcome::timed_out(Duration::from_millis(1500)),
            ExecutionOutcome::TimedOut { deadline_ms: 1500 }
        );
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::to_value(ExecutionOutcome::runtime_error("x")).unwrap();
        assert_eq!(json["kind"], "thrown");
        assert_eq!(json["class"], "runtime");
        assert_eq!(json["message"], "x");

        let back: ExecutionOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, ExecutionOutcome::runtime_error("x"));
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::Compile.to_string(), "syntax");
        assert_eq!(ErrorClass::Timeout.to_string(), "timeout");
    }
}
