//! Status enums for Tasks, Workers and browser pool entries.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a crawl Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is queued and waiting for a worker.
    #[default]
    Pending,
    /// Task is owned by a worker.
    Active,
    /// Task failed and waits for its backoff delay before being re-queued.
    Retrying,
    /// Task completed successfully.
    Completed,
    /// Task failed permanently.
    Failed,
}

impl TaskStatus {
    /// Returns true if the task reached a final outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase name, used in logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// State of a worker's execution loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for a task.
    #[default]
    Idle,
    /// Task dequeued, acquiring a browser page.
    Fetching,
    /// Expanding the node on a browser page.
    Running,
    /// Task finished successfully.
    Completed,
    /// Task failed and was scheduled for another attempt.
    RetryScheduled,
    /// Task failed permanently.
    Failed,
    /// Worker is leaving its loop.
    ShuttingDown,
}

impl WorkerState {
    /// Returns true while the worker holds a task.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Fetching | Self::Running)
    }
}

/// Health of a single browser pool entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    #[default]
    Healthy,
    Degraded,
}

/// State of the browser pool circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Pages are reused.
    #[default]
    Closed,
    /// Reuse is suspended; every acquisition opens a fresh page.
    Open,
}
