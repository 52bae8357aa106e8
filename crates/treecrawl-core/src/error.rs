//! Per-task failure taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a task failure must be handled, decided once where the error is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Navigation or page timeout. Retried with backoff.
    TransientIo,
    /// The page or tree did not have the expected shape. Terminal for the task.
    Structural,
    /// Pool exhausted or circuit open. Retried with backoff and reported to
    /// the scaling engine.
    ResourceExhaustion,
}

impl FailureClass {
    /// Returns true if a task failing with this class may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Structural)
    }
}

/// Errors raised while executing a single crawl task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Navigation, DOM query or page load exceeded its deadline or failed in transit.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The page or node did not have the expected structure.
    #[error("Unexpected page structure: {0}")]
    Structural(String),

    /// No browser page could be obtained.
    #[error("Browser resources exhausted: {0}")]
    ResourceExhaustion(String),
}

impl TaskError {
    /// Classify this error.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::TransientIo(_) => FailureClass::TransientIo,
            Self::Structural(_) => FailureClass::Structural,
            Self::ResourceExhaustion(_) => FailureClass::ResourceExhaustion,
        }
    }

    /// Shorthand for `self.class().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Build a timeout error for an operation that exceeded `limit`.
    pub fn timeout(operation: &str, limit: std::time::Duration) -> Self {
        Self::TransientIo(format!("{operation} timed out after {limit:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        assert!(TaskError::TransientIo("reset".into()).is_retryable());
        assert!(TaskError::ResourceExhaustion("pool".into()).is_retryable());
        assert!(!TaskError::Structural("no tree".into()).is_retryable());
        assert_eq!(
            TaskError::ResourceExhaustion("x".into()).class(),
            FailureClass::ResourceExhaustion
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = TaskError::timeout("navigate", Duration::from_secs(30));
        assert_eq!(err.class(), FailureClass::TransientIo);
        assert!(err.to_string().contains("navigate timed out after 30s"));
    }
}
