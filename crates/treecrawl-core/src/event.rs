//! Observability events emitted while a crawl runs.

use crate::ids::{TaskId, WorkerId};
use crate::{CircuitState, TaskStatus};
use serde::{Deserialize, Serialize};

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Category of an event, used to enable or silence whole groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    TaskStart,
    TaskCompletion,
    ScalingDecision,
    PoolStatus,
}

impl EventCategory {
    /// Every category, in declaration order.
    pub const ALL: [EventCategory; 4] = [
        Self::TaskStart,
        Self::TaskCompletion,
        Self::ScalingDecision,
        Self::PoolStatus,
    ];
}

/// Payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A worker took ownership of a task.
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
        path: String,
        depth: u32,
        attempt: u32,
    },
    /// A task attempt finished (completed, failed or scheduled for retry).
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        status: TaskStatus,
        children: usize,
        duration_ms: u64,
    },
    /// The scaling engine changed or confirmed the worker target.
    ScalingDecision {
        action: ScalingAction,
        current: usize,
        target: usize,
        reason: String,
    },
    /// Periodic browser pool summary.
    PoolStatus {
        size: usize,
        checked_out: usize,
        idle: usize,
        circuit: CircuitState,
    },
}

/// A timestamped observability event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlEvent {
    /// Unix timestamp (milliseconds) when the event occurred.
    pub timestamp_ms: i64,
    /// What happened.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl CrawlEvent {
    /// Create a new event stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            kind,
        }
    }

    /// Create a TaskStarted event.
    pub fn task_started(
        task_id: TaskId,
        worker_id: WorkerId,
        path: impl Into<String>,
        depth: u32,
        attempt: u32,
    ) -> Self {
        Self::new(EventKind::TaskStarted {
            task_id,
            worker_id,
            path: path.into(),
            depth,
            attempt,
        })
    }

    /// Create a TaskCompleted event.
    pub fn task_completed(
        task_id: TaskId,
        worker_id: WorkerId,
        status: TaskStatus,
        children: usize,
        duration_ms: u64,
    ) -> Self {
        Self::new(EventKind::TaskCompleted {
            task_id,
            worker_id,
            status,
            children,
            duration_ms,
        })
    }

    /// Create a ScalingDecision event.
    pub fn scaling_decision(
        action: ScalingAction,
        current: usize,
        target: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::ScalingDecision {
            action,
            current,
            target,
            reason: reason.into(),
        })
    }

    /// Create a PoolStatus event.
    pub fn pool_status(
        size: usize,
        checked_out: usize,
        idle: usize,
        circuit: CircuitState,
    ) -> Self {
        Self::new(EventKind::PoolStatus {
            size,
            checked_out,
            idle,
            circuit,
        })
    }

    /// Category this event belongs to.
    pub fn category(&self) -> EventCategory {
        match self.kind {
            EventKind::TaskStarted { .. } => EventCategory::TaskStart,
            EventKind::TaskCompleted { .. } => EventCategory::TaskCompletion,
            EventKind::ScalingDecision { .. } => EventCategory::ScalingDecision,
            EventKind::PoolStatus { .. } => EventCategory::PoolStatus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_started() {
        let task_id = TaskId::generate();
        let event = CrawlEvent::task_started(task_id.clone(), WorkerId::numbered(1), "A > B", 1, 0);

        assert_eq!(event.category(), EventCategory::TaskStart);
        assert!(event.timestamp_ms > 0);
        match event.kind {
            EventKind::TaskStarted { task_id: id, depth, .. } => {
                assert_eq!(id, task_id);
                assert_eq!(depth, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_scaling_decision_category() {
        let event = CrawlEvent::scaling_decision(ScalingAction::ScaleUp, 4, 8, "backlog");
        assert_eq!(event.category(), EventCategory::ScalingDecision);
    }
}
