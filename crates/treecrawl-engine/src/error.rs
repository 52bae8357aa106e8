//! Engine-level errors.

use thiserror::Error;

use treecrawl_core::{TaskError, TaskId};

use crate::config::ConfigError;

/// Errors that end or reject engine operations.
///
/// Per-task failures never surface here; they are contained in the task's
/// retry lifecycle and reported in the crawl results.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration was rejected before any worker ran.
    #[error("Fatal configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Root discovery failed on every attempt.
    #[error("Root discovery failed: {0}")]
    Discovery(TaskError),

    /// Work was submitted after shutdown was signalled.
    #[error("Task {0} rejected: shutdown in progress")]
    ShuttingDown(TaskId),
}

/// Errors from the hierarchical tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// A child or start record referenced a parent that is not tracked.
    #[error("Parent task not tracked: {0}")]
    UnknownParent(TaskId),

    /// The task has no record.
    #[error("Task not tracked: {0}")]
    UnknownTask(TaskId),
}
