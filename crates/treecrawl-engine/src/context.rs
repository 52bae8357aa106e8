//! Shared crawl context: the task queue and completion accounting.
//!
//! Every mutation goes through one lock so that moving a task id between the
//! pending, active, completed and failed sets is a single atomic step. The
//! lock is never held across an await point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use treecrawl_core::{NodeInfo, Task, TaskFailure, TaskId, TaskStatus};

use crate::error::EngineError;

/// A task waiting out its retry backoff.
#[derive(Debug)]
struct DelayedTask {
    ready_at: Instant,
    task: Task,
}

#[derive(Debug, Default)]
struct ContextState {
    queue: VecDeque<Task>,
    delayed: Vec<DelayedTask>,
    active: HashSet<TaskId>,
    completed: HashMap<TaskId, NodeInfo>,
    failed: HashMap<TaskId, TaskFailure>,
    total_created: u64,
    total_completed: u64,
    total_failed: u64,
    total_retries: u64,
}

impl ContextState {
    /// Move retries whose backoff elapsed to the back of the queue.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].ready_at <= now {
                let mut task = self.delayed.swap_remove(i).task;
                task.status = TaskStatus::Pending;
                self.queue.push_back(task);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|d| d.ready_at).min()
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.delayed.is_empty() && self.active.is_empty()
    }

    fn activate(&mut self, mut task: Task) -> Task {
        task.status = TaskStatus::Active;
        self.active.insert(task.id.clone());
        task
    }
}

/// Point-in-time view of the context counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextSnapshot {
    /// Tasks waiting in the queue.
    pub queue_depth: usize,
    /// Tasks waiting out a retry backoff.
    pub delayed_retries: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_created: u64,
    pub total_retries: u64,
    /// Completed tasks as a percentage of created tasks.
    pub completion_rate: f64,
    pub elapsed_secs: f64,
}

impl ContextSnapshot {
    /// Tasks not yet owned by a worker, including delayed retries.
    pub fn pending(&self) -> usize {
        self.queue_depth + self.delayed_retries
    }
}

/// Final per-task outcomes of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlResults {
    pub completed: HashMap<TaskId, NodeInfo>,
    pub failed: HashMap<TaskId, TaskFailure>,
}

/// The shared context handed to every worker.
pub struct WorkerContext {
    state: Mutex<ContextState>,
    /// Signalled when a task becomes available.
    task_ready: Notify,
    /// Signalled when the context becomes drained.
    drained: Notify,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl WorkerContext {
    /// Create an empty context with its own shutdown token.
    pub fn new() -> Self {
        Self::with_shutdown(CancellationToken::new())
    }

    /// Create an empty context driven by an existing shutdown token.
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        Self {
            state: Mutex::new(ContextState::default()),
            task_ready: Notify::new(),
            drained: Notify::new(),
            shutdown,
            started_at: Instant::now(),
        }
    }

    /// Submit a new task to the back of the queue.
    pub fn enqueue(&self, mut task: Task) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            warn!(task_id = %task.id, "Task submission rejected - shutdown in progress");
            return Err(EngineError::ShuttingDown(task.id));
        }

        {
            let mut state = self.state.lock();
            task.status = TaskStatus::Pending;
            debug!(task_id = %task.id, priority = task.priority, "Task submitted");
            state.queue.push_back(task);
            state.total_created += 1;
        }

        self.task_ready.notify_one();
        Ok(())
    }

    /// Take the next task, waiting up to `timeout` for one to appear.
    ///
    /// The returned task is already active: it leaves the queue and enters
    /// the active set in the same locked step. Returns `None` on timeout or
    /// once shutdown was signalled.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.task_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                return None;
            }

            let wake_at = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.promote_due(now);

                if let Some(task) = state.queue.pop_front() {
                    return Some(state.activate(task));
                }
                if now >= deadline {
                    return None;
                }
                state.next_due().map_or(deadline, |due| due.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Claim a specific queued task. Returns `None` if it is not queued.
    pub fn mark_active(&self, id: &TaskId) -> Option<Task> {
        let mut state = self.state.lock();
        let pos = state.queue.iter().position(|t| &t.id == id)?;
        let task = state.queue.remove(pos)?;
        Some(state.activate(task))
    }

    /// Record a successful outcome. Returns false if `id` was not active.
    pub fn mark_completed(&self, id: &TaskId, result: NodeInfo) -> bool {
        let drained = {
            let mut state = self.state.lock();
            if !state.active.remove(id) {
                warn!(task_id = %id, "Completion for a task that is not active - ignored");
                return false;
            }
            debug!(task_id = %id, label = %result.label, "Task completed");
            state.completed.insert(id.clone(), result);
            state.total_completed += 1;
            state.is_drained()
        };

        if drained {
            self.drained.notify_waiters();
        }
        true
    }

    /// Record a terminal failure. Returns false if `id` was not active.
    pub fn mark_failed(&self, id: &TaskId, failure: TaskFailure) -> bool {
        let drained = {
            let mut state = self.state.lock();
            if !state.active.remove(id) {
                warn!(task_id = %id, "Failure for a task that is not active - ignored");
                return false;
            }
            warn!(task_id = %id, error = %failure.error, "Task failed permanently");
            state.failed.insert(id.clone(), failure);
            state.total_failed += 1;
            state.is_drained()
        };

        if drained {
            self.drained.notify_waiters();
        }
        true
    }

    /// Hand an active task back to the queue after `delay`.
    ///
    /// Active -> pending happens in one locked step; the retry count is
    /// incremented here. Returns the new retry count, or `None` if the task
    /// was not active.
    pub fn schedule_retry(&self, mut task: Task, delay: Duration) -> Option<u32> {
        let attempt = {
            let mut state = self.state.lock();
            if !state.active.remove(&task.id) {
                warn!(task_id = %task.id, "Retry for a task that is not active - ignored");
                return None;
            }
            task.retry_count += 1;
            task.status = TaskStatus::Retrying;
            let attempt = task.retry_count;
            state.delayed.push(DelayedTask {
                ready_at: Instant::now() + delay,
                task,
            });
            state.total_retries += 1;
            attempt
        };

        // Waiting workers recompute their wake-up time.
        self.task_ready.notify_waiters();
        Some(attempt)
    }

    /// True when nothing is queued, delayed or active.
    pub fn is_drained(&self) -> bool {
        self.state.lock().is_drained()
    }

    /// Resolve once the context is drained.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }

    /// Signal every worker to begin shutdown.
    pub fn signal_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutdown signal sent to all workers");
        }
        self.shutdown.cancel();
        self.task_ready.notify_waiters();
    }

    /// Check if shutdown was signalled.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The token cancelled by [`signal_shutdown`](Self::signal_shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current counters.
    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock();
        ContextSnapshot {
            queue_depth: state.queue.len(),
            delayed_retries: state.delayed.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            total_created: state.total_created,
            total_retries: state.total_retries,
            completion_rate: state.total_completed as f64 / state.total_created.max(1) as f64
                * 100.0,
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Copy of the completed and failed maps.
    pub fn results(&self) -> CrawlResults {
        let state = self.state.lock();
        CrawlResults {
            completed: state.completed.clone(),
            failed: state.failed.clone(),
        }
    }

    /// True if `id` is currently owned by a worker.
    pub fn is_active(&self, id: &TaskId) -> bool {
        self.state.lock().active.contains(id)
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}
