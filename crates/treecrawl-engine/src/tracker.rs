//! Hierarchical task tracking.
//!
//! Records parent/child edges between tasks and keeps status counters
//! (overall and per depth) up to date as tasks move through their lifecycle.
//! [`Tracker::Noop`] has the same contract and does nothing, so callers never
//! branch on whether tracking is enabled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use treecrawl_core::{Task, TaskId, TaskStatus, WorkerId, WorkerState};

use crate::config::TrackingConfig;
use crate::error::TrackerError;

/// Descriptive data attached to a tracked task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskMetadata {
    pub label: String,
    pub path: String,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TaskMetadata {
    pub fn from_task(task: &Task) -> Self {
        Self {
            label: task.node.label.clone(),
            path: task.node.path.clone(),
            depth: task.node.depth,
            url: task.node.url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct TaskRecord {
    parent_id: Option<TaskId>,
    children: Vec<TaskId>,
    status: TaskStatus,
    worker_id: Option<WorkerId>,
    metadata: TaskMetadata,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Counts of tasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    fn slot(&mut self, status: TaskStatus) -> &mut usize {
        match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Active => &mut self.running,
            TaskStatus::Retrying => &mut self.retrying,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
        }
    }

    fn add(&mut self, status: TaskStatus) {
        self.total += 1;
        *self.slot(status) += 1;
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) {
        let old = self.slot(from);
        *old = old.saturating_sub(1);
        *self.slot(to) += 1;
    }
}

/// Worker counts by activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    /// Workers that retired or exited.
    pub stopped: usize,
}

/// Shape of the tracked forest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HierarchyStats {
    pub root_tasks: usize,
    pub max_depth: u32,
    pub total_children: usize,
    pub avg_children_per_task: f64,
}

/// Snapshot returned by [`Tracker::get_tracking_statistics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackingStatistics {
    pub tasks: StatusCounts,
    pub by_depth: BTreeMap<u32, StatusCounts>,
    pub workers: WorkerCounts,
    pub hierarchy: HierarchyStats,
}

/// A task and its tracked descendants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHierarchy {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub worker_id: Option<WorkerId>,
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub children: Vec<TaskHierarchy>,
    /// Status counts over all descendants (the task itself excluded).
    pub rollup: StatusCounts,
}

#[derive(Debug, Default)]
struct TrackerState {
    tasks: HashMap<TaskId, TaskRecord>,
    roots: Vec<TaskId>,
    workers: HashMap<WorkerId, WorkerState>,
    counts: StatusCounts,
    by_depth: BTreeMap<u32, StatusCounts>,
    total_children: usize,
    max_depth: u32,
}

impl TrackerState {
    fn insert(&mut self, id: TaskId, record: TaskRecord) {
        let depth = record.metadata.depth;
        self.counts.add(record.status);
        self.by_depth.entry(depth).or_default().add(record.status);
        self.max_depth = self.max_depth.max(depth);
        if record.parent_id.is_none() {
            self.roots.push(id.clone());
        }
        self.tasks.insert(id, record);
    }

    fn set_status(&mut self, id: &TaskId, to: TaskStatus) -> Result<bool, TrackerError> {
        let record = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownTask(id.clone()))?;
        let from = record.status;
        if from.is_terminal() || from == to {
            return Ok(false);
        }
        record.status = to;
        let depth = record.metadata.depth;
        self.counts.transition(from, to);
        self.by_depth.entry(depth).or_default().transition(from, to);
        Ok(true)
    }

    fn hierarchy(&self, id: &TaskId) -> Option<TaskHierarchy> {
        let record = self.tasks.get(id)?;
        let mut rollup = StatusCounts::default();
        let children: Vec<TaskHierarchy> = record
            .children
            .iter()
            .filter_map(|child| self.hierarchy(child))
            .collect();
        for child in &children {
            rollup.add(child.status);
            rollup.total += child.rollup.total;
            rollup.pending += child.rollup.pending;
            rollup.running += child.rollup.running;
            rollup.retrying += child.rollup.retrying;
            rollup.completed += child.rollup.completed;
            rollup.failed += child.rollup.failed;
        }
        Some(TaskHierarchy {
            task_id: id.clone(),
            status: record.status,
            worker_id: record.worker_id.clone(),
            metadata: record.metadata.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            children,
            rollup,
        })
    }
}

/// Tracker backed by an in-memory record map.
#[derive(Debug, Default)]
pub struct HierarchicalTracker {
    state: Mutex<TrackerState>,
}

impl HierarchicalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a task as running on `worker_id`.
    ///
    /// Creates the record on first sight. A `parent_id` must already be
    /// tracked. Starting a task that already finished is ignored.
    pub fn track_task_start(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        parent_id: Option<&TaskId>,
        metadata: TaskMetadata,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        if let Some(parent) = parent_id {
            if !state.tasks.contains_key(parent) {
                return Err(TrackerError::UnknownParent(parent.clone()));
            }
        }

        if !state.tasks.contains_key(task_id) {
            state.insert(
                task_id.clone(),
                TaskRecord {
                    parent_id: parent_id.cloned(),
                    children: Vec::new(),
                    status: TaskStatus::Pending,
                    worker_id: None,
                    metadata: metadata.clone(),
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                },
            );
            if let Some(parent) = parent_id {
                link_child(&mut state, parent, task_id);
            }
        }

        if !state.set_status(task_id, TaskStatus::Active)? {
            return Ok(());
        }
        if let Some(record) = state.tasks.get_mut(task_id) {
            record.worker_id = Some(worker_id.clone());
            record.started_at = Some(Utc::now());
            // Child records created before the task ran carry no label yet.
            if record.metadata.label.is_empty() {
                record.metadata = metadata;
            }
        }
        state.workers.insert(worker_id.clone(), WorkerState::Running);
        debug!(task_id = %task_id, worker_id = %worker_id, "Tracking task start");
        Ok(())
    }

    /// Record a status change for a tracked task.
    ///
    /// Terminal statuses stamp the finish time. Calls after a terminal status
    /// are ignored so an outcome is counted once.
    pub fn track_task_completion(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        if state.set_status(task_id, status)? && status.is_terminal() {
            if let Some(record) = state.tasks.get_mut(task_id) {
                record.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    /// Record that `parent_id` spawned `child_id`. The child gets a pending
    /// record one level below its parent.
    pub fn track_task_child_creation(
        &self,
        parent_id: &TaskId,
        child_id: &TaskId,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        let parent_depth = state
            .tasks
            .get(parent_id)
            .map(|p| p.metadata.depth)
            .ok_or_else(|| TrackerError::UnknownParent(parent_id.clone()))?;

        if !state.tasks.contains_key(child_id) {
            state.insert(
                child_id.clone(),
                TaskRecord {
                    parent_id: Some(parent_id.clone()),
                    children: Vec::new(),
                    status: TaskStatus::Pending,
                    worker_id: None,
                    metadata: TaskMetadata {
                        depth: parent_depth + 1,
                        ..TaskMetadata::default()
                    },
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                },
            );
        }
        link_child(&mut state, parent_id, child_id);
        Ok(())
    }

    pub fn update_worker_state(&self, worker_id: &WorkerId, worker_state: WorkerState) {
        self.state.lock().workers.insert(worker_id.clone(), worker_state);
    }

    pub fn get_task_hierarchy(&self, task_id: &TaskId) -> Option<TaskHierarchy> {
        self.state.lock().hierarchy(task_id)
    }

    /// Ids of tasks without a parent, in the order they were first tracked.
    pub fn get_root_tasks(&self) -> Vec<TaskId> {
        self.state.lock().roots.clone()
    }

    pub fn get_tracking_statistics(&self) -> TrackingStatistics {
        let state = self.state.lock();
        let busy = state.workers.values().filter(|w| w.is_busy()).count();
        let stopped = state
            .workers
            .values()
            .filter(|w| **w == WorkerState::ShuttingDown)
            .count();
        let tasks = state.tasks.len();
        TrackingStatistics {
            tasks: state.counts,
            by_depth: state.by_depth.clone(),
            workers: WorkerCounts {
                total: state.workers.len(),
                busy,
                idle: state.workers.len() - busy - stopped,
                stopped,
            },
            hierarchy: HierarchyStats {
                root_tasks: state.roots.len(),
                max_depth: state.max_depth,
                total_children: state.total_children,
                avg_children_per_task: if tasks == 0 {
                    0.0
                } else {
                    state.total_children as f64 / tasks as f64
                },
            },
        }
    }
}

fn link_child(state: &mut TrackerState, parent_id: &TaskId, child_id: &TaskId) {
    let Some(parent) = state.tasks.get_mut(parent_id) else {
        return;
    };
    if !parent.children.contains(child_id) {
        parent.children.push(child_id.clone());
        state.total_children += 1;
    }
}

/// Tracker handle used by the engine. Cheap to clone.
#[derive(Debug, Clone)]
pub enum Tracker {
    Hierarchical(Arc<HierarchicalTracker>),
    Noop,
}

impl Tracker {
    pub fn new(config: &TrackingConfig) -> Self {
        if config.enabled {
            Self::Hierarchical(Arc::new(HierarchicalTracker::new()))
        } else {
            Self::Noop
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Hierarchical(_))
    }

    pub fn track_task_start(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        parent_id: Option<&TaskId>,
        metadata: TaskMetadata,
    ) -> Result<(), TrackerError> {
        match self {
            Self::Hierarchical(t) => t.track_task_start(task_id, worker_id, parent_id, metadata),
            Self::Noop => Ok(()),
        }
    }

    pub fn track_task_completion(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), TrackerError> {
        match self {
            Self::Hierarchical(t) => t.track_task_completion(task_id, status),
            Self::Noop => Ok(()),
        }
    }

    pub fn track_task_child_creation(
        &self,
        parent_id: &TaskId,
        child_id: &TaskId,
    ) -> Result<(), TrackerError> {
        match self {
            Self::Hierarchical(t) => t.track_task_child_creation(parent_id, child_id),
            Self::Noop => Ok(()),
        }
    }

    pub fn update_worker_state(&self, worker_id: &WorkerId, state: WorkerState) {
        if let Self::Hierarchical(t) = self {
            t.update_worker_state(worker_id, state);
        }
    }

    pub fn get_task_hierarchy(&self, task_id: &TaskId) -> Option<TaskHierarchy> {
        match self {
            Self::Hierarchical(t) => t.get_task_hierarchy(task_id),
            Self::Noop => None,
        }
    }

    pub fn get_root_tasks(&self) -> Vec<TaskId> {
        match self {
            Self::Hierarchical(t) => t.get_root_tasks(),
            Self::Noop => Vec::new(),
        }
    }

    pub fn get_tracking_statistics(&self) -> TrackingStatistics {
        match self {
            Self::Hierarchical(t) => t.get_tracking_statistics(),
            Self::Noop => TrackingStatistics::default(),
        }
    }

    /// Hierarchies of every root task.
    pub fn forest(&self) -> Vec<TaskHierarchy> {
        self.get_root_tasks()
            .iter()
            .filter_map(|id| self.get_task_hierarchy(id))
            .collect()
    }
}
