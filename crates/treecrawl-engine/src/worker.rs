//! Worker execution loop.
//!
//! A worker repeatedly takes a task from the shared context, expands the
//! task's node on a pooled browser page, publishes the discovered children as
//! new tasks and records the outcome. Failed attempts go through the retry
//! policy. Workers exit when the run drains, when shutdown is signalled, or
//! when their retire token fires (after finishing the current task).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use treecrawl_core::{
    CrawlEvent, FailureClass, NodeInfo, Task, TaskError, TaskFailure, TaskStatus, WorkerId,
    WorkerState,
};

use crate::browser::Discovery;
use crate::config::WorkerConfig;
use crate::context::WorkerContext;
use crate::events::EventBus;
use crate::pool::BrowserPool;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::telemetry::Telemetry;
use crate::tracker::{TaskMetadata, Tracker};

/// Everything a worker shares with the rest of the run.
#[derive(Clone)]
pub struct WorkerResources {
    pub ctx: Arc<WorkerContext>,
    pub pool: BrowserPool,
    pub discovery: Arc<dyn Discovery>,
    pub tracker: Tracker,
    pub retry: RetryPolicy,
    pub events: EventBus,
    pub telemetry: Arc<Telemetry>,
    pub config: WorkerConfig,
}

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// No work was left anywhere.
    Drained,
    /// The scaling engine asked for fewer workers.
    Retired,
    /// The run is shutting down.
    Shutdown,
}

/// Summary returned by [`Worker::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub id: WorkerId,
    /// Tasks completed successfully.
    pub processed: u64,
    /// Tasks that failed permanently.
    pub failed: u64,
    /// Attempts handed back for retry.
    pub retried: u64,
    pub exit: WorkerExit,
}

enum Outcome {
    Completed,
    Retried,
    Failed,
}

pub struct Worker {
    id: WorkerId,
    resources: Arc<WorkerResources>,
    retire: CancellationToken,
}

impl Worker {
    pub fn new(id: WorkerId, resources: Arc<WorkerResources>, retire: CancellationToken) -> Self {
        Self {
            id,
            resources,
            retire,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    fn set_state(&self, state: WorkerState) {
        debug!(worker_id = %self.id, ?state, "Worker state");
        self.resources.tracker.update_worker_state(&self.id, state);
    }

    pub async fn run(self) -> WorkerReport {
        let ctx = self.resources.ctx.clone();
        let timeout = self.resources.config.dequeue_timeout;
        let mut report = WorkerReport {
            id: self.id.clone(),
            processed: 0,
            failed: 0,
            retried: 0,
            exit: WorkerExit::Drained,
        };

        info!(worker_id = %self.id, "Worker started");
        self.set_state(WorkerState::Idle);

        report.exit = loop {
            let next = tokio::select! {
                biased;
                _ = self.retire.cancelled() => {
                    break if ctx.is_shutdown() {
                        WorkerExit::Shutdown
                    } else {
                        WorkerExit::Retired
                    };
                }
                next = ctx.dequeue(timeout) => next,
            };

            match next {
                Some(task) => {
                    let held = task.clone();
                    let attempt = AssertUnwindSafe(self.process(task)).catch_unwind();
                    let outcome = match attempt.await {
                        Ok(outcome) => Some(outcome),
                        Err(panic) => self.handle_panic(held, panic_message(&*panic)),
                    };
                    match outcome {
                        Some(Outcome::Completed) => report.processed += 1,
                        Some(Outcome::Retried) => report.retried += 1,
                        Some(Outcome::Failed) => report.failed += 1,
                        None => {}
                    }
                    self.set_state(WorkerState::Idle);
                }
                None if ctx.is_shutdown() => break WorkerExit::Shutdown,
                None if ctx.is_drained() => break WorkerExit::Drained,
                None => continue,
            }
        };

        self.set_state(WorkerState::ShuttingDown);
        info!(
            worker_id = %self.id,
            processed = report.processed,
            failed = report.failed,
            exit = ?report.exit,
            "Worker stopped"
        );
        report
    }

    async fn process(&self, task: Task) -> Outcome {
        let res = &self.resources;
        let started = Instant::now();

        self.set_state(WorkerState::Fetching);
        if let Err(e) = res.tracker.track_task_start(
            &task.id,
            &self.id,
            task.parent_id.as_ref(),
            TaskMetadata::from_task(&task),
        ) {
            warn!(task_id = %task.id, error = %e, "Tracker rejected task start");
        }
        res.events.publish(CrawlEvent::task_started(
            task.id.clone(),
            self.id.clone(),
            task.node.path.clone(),
            task.node.depth,
            task.retry_count,
        ));
        debug!(
            task_id = %task.id,
            path = %task.node.path,
            attempt = task.retry_count,
            "Processing task"
        );

        let mut lease = match res.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => return self.handle_failure(task, e, started),
        };

        self.set_state(WorkerState::Running);
        let expanded = if task.node.depth >= res.config.max_depth {
            debug!(
                task_id = %task.id,
                depth = task.node.depth,
                "Maximum depth reached, not expanding"
            );
            Ok(Vec::new())
        } else {
            res.discovery.expand(&mut lease, &task.node).await
        };
        let page_ok = match &expanded {
            Ok(_) => true,
            Err(e) => e.class() == FailureClass::Structural,
        };
        res.pool.release(lease, page_ok).await;

        match expanded {
            Ok(children) => self.complete(task, children, started),
            Err(e) => self.handle_failure(task, e, started),
        }
    }

    fn complete(&self, task: Task, mut children: Vec<NodeInfo>, started: Instant) -> Outcome {
        let res = &self.resources;
        let limit = res.config.max_children_per_node;
        if children.len() > limit {
            warn!(
                task_id = %task.id,
                found = children.len(),
                limit,
                "Child limit reached, extra children dropped"
            );
            children.truncate(limit);
        }

        let mut result = task.node.clone();
        result.is_leaf = children.is_empty();
        result.worker_id = Some(self.id.clone());
        result.children = children.iter().map(|c| c.label.clone()).collect();

        // Children go in before the parent completes so the run can't be
        // observed drained in between.
        let mut spawned = 0;
        for node in children {
            let child = task.child(node);
            if let Err(e) = res.tracker.track_task_child_creation(&task.id, &child.id) {
                warn!(task_id = %task.id, error = %e, "Tracker rejected child");
            }
            if let Err(e) = res.ctx.enqueue(child) {
                debug!(task_id = %task.id, error = %e, "Remaining children not queued");
                break;
            }
            spawned += 1;
        }

        res.ctx.mark_completed(&task.id, result);
        if let Err(e) = res.tracker.track_task_completion(&task.id, TaskStatus::Completed) {
            warn!(task_id = %task.id, error = %e, "Tracker rejected completion");
        }
        res.telemetry.record_completion();
        res.events.publish(CrawlEvent::task_completed(
            task.id.clone(),
            self.id.clone(),
            TaskStatus::Completed,
            spawned,
            elapsed_ms(started),
        ));
        debug!(task_id = %task.id, children = spawned, "Task completed");
        self.set_state(WorkerState::Completed);
        Outcome::Completed
    }

    /// Fail a task whose attempt panicked. Panicked attempts are not retried.
    /// Returns `None` if the task had already been settled when it panicked.
    fn handle_panic(&self, task: Task, message: String) -> Option<Outcome> {
        let res = &self.resources;
        let err = TaskError::Structural(format!("task attempt panicked: {message}"));
        error!(
            worker_id = %self.id,
            task_id = %task.id,
            path = %task.node.path,
            error = %err,
            "Task attempt panicked"
        );
        if !res.ctx.mark_failed(&task.id, TaskFailure::new(&task, &err)) {
            return None;
        }
        res.telemetry.record_failure(err.class());
        if let Err(e) = res.tracker.track_task_completion(&task.id, TaskStatus::Failed) {
            warn!(task_id = %task.id, error = %e, "Tracker rejected status change");
        }
        res.events.publish(CrawlEvent::task_completed(
            task.id.clone(),
            self.id.clone(),
            TaskStatus::Failed,
            0,
            0,
        ));
        self.set_state(WorkerState::Failed);
        Some(Outcome::Failed)
    }

    fn handle_failure(&self, task: Task, err: TaskError, started: Instant) -> Outcome {
        let res = &self.resources;
        res.telemetry.record_failure(err.class());
        let task_id = task.id.clone();

        let (status, outcome) = match res.retry.decide(&task, &err) {
            RetryDecision::Retry { delay, attempt } => {
                warn!(
                    task_id = %task_id,
                    path = %task.node.path,
                    attempt,
                    max_retries = res.retry.max_retries(),
                    delay = ?delay,
                    error = %err,
                    "Task failed, scheduling retry"
                );
                res.ctx.schedule_retry(task, delay);
                self.set_state(WorkerState::RetryScheduled);
                (TaskStatus::Retrying, Outcome::Retried)
            }
            RetryDecision::Fail => {
                error!(
                    task_id = %task_id,
                    path = %task.node.path,
                    retries = task.retry_count,
                    error = %err,
                    "Task failed permanently"
                );
                res.ctx.mark_failed(&task_id, TaskFailure::new(&task, &err));
                self.set_state(WorkerState::Failed);
                (TaskStatus::Failed, Outcome::Failed)
            }
        };

        if let Err(e) = res.tracker.track_task_completion(&task_id, status) {
            warn!(task_id = %task_id, error = %e, "Tracker rejected status change");
        }
        res.events.publish(CrawlEvent::task_completed(
            task_id,
            self.id.clone(),
            status,
            0,
            elapsed_ms(started),
        ));
        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
