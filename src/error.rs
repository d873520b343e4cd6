//! Request rejection errors.
//!
//! These are the only errors [`ExecutionEngine::execute`] returns. They
//! describe requests that were never run. Problems while running a program
//! are reported as an
//! [`ExecutionOutcome`](crate::sandbox::outcome::ExecutionOutcome) instead.
//!
//! [`ExecutionEngine::execute`]: crate::sandbox::engine::ExecutionEngine::execute

use thiserror::Error;

/// Reasons a request is refused before any worker is started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The program text is empty.
    #[error("Invalid code provided")]
    EmptySource,

    /// The program text exceeds the configured size cap.
    #[error("Code is too large: {actual} bytes exceeds the limit of {limit} bytes")]
    SourceTooLarge { limit: usize, actual: usize },

    /// Every worker slot is busy and the admission policy is `reject`.
    #[error("Too many concurrent executions (limit {limit})")]
    Saturated { limit: usize },
}

impl RequestError {
    /// Whether the caller sent something invalid, as opposed to the engine
    /// being temporarily unable to accept work.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RequestError::EmptySource | RequestError::SourceTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(RequestError::EmptySource.to_string(), "Invalid code provided");
        assert_eq!(
            RequestError::SourceTooLarge { limit: 10, actual: 12 }.to_string(),
            "Code is too large: 12 bytes exceeds the limit of 10 bytes"
        );
        assert_eq!(
            RequestError::Saturated { limit: 2 }.to_string(),
            "Too many concurrent executions (limit 2)"
        );
    }

    #[test]
    fn test_client_error_classification() {
        assert!(RequestError::EmptySource.is_client_error());
        assert!(RequestError::SourceTooLarge { limit: 1, actual: 2 }.is_client_error());
        assert!(!RequestError::Saturated { limit: 1 }.is_client_error());
    }
}
