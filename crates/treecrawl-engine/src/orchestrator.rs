//! Run orchestration.
//!
//! The orchestrator validates the configuration, discovers the root nodes,
//! seeds the queue, keeps the worker set at the scaling engine's target,
//! detects drain and shuts everything down in order: workers (bounded by the
//! shutdown timeout), background loops, then the browser pool.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use treecrawl_core::{
    CrawlEvent, EventCategory, FailureClass, NodeInfo, Task, TaskFailure, TaskId, WorkerId,
};

use crate::browser::{BrowserDriver, Discovery};
use crate::config::EngineConfig;
use crate::context::{ContextSnapshot, WorkerContext};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::pool::{BrowserPool, PoolStatus};
use crate::resources::SystemMonitor;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scaling::{ScalingDecision, ScalingEngine, ScalingReport};
use crate::telemetry::{render_prometheus, Telemetry, TelemetryTotals};
use crate::tracker::{TaskHierarchy, Tracker, TrackingStatistics};
use crate::worker::{Worker, WorkerReport, WorkerResources};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlOutcome {
    /// Every task completed.
    Completed,
    /// The run drained but some tasks failed permanently.
    CompletedWithFailures,
    /// Shutdown was requested before the run drained.
    Interrupted,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub outcome: CrawlOutcome,
    pub completed: HashMap<TaskId, NodeInfo>,
    pub failed: HashMap<TaskId, TaskFailure>,
    pub statistics: TrackingStatistics,
    pub hierarchy: Vec<TaskHierarchy>,
    pub counters: ContextSnapshot,
    pub telemetry: TelemetryTotals,
    pub pool: PoolStatus,
    /// Reports of workers that exited on their own; aborted workers have none.
    pub workers: Vec<WorkerReport>,
    pub workers_spawned: usize,
    pub scaling_history: Vec<ScalingDecision>,
    pub elapsed_secs: f64,
}

impl CrawlReport {
    /// Render the report's counters in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        render_prometheus(
            &self.counters,
            &self.pool,
            &self.telemetry,
            self.workers_spawned,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Drained,
    Shutdown,
}

/// Live worker tasks. Retire tokens are kept newest last so shrinking
/// retires the most recently spawned workers first.
struct WorkerSet {
    tasks: JoinSet<WorkerReport>,
    ids: HashMap<tokio::task::Id, WorkerId>,
    retire: Vec<(WorkerId, CancellationToken)>,
    next_id: u64,
    resources: Arc<WorkerResources>,
    shutdown: CancellationToken,
    reports: Vec<WorkerReport>,
}

impl WorkerSet {
    fn new(resources: Arc<WorkerResources>, shutdown: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            ids: HashMap::new(),
            retire: Vec::new(),
            next_id: 1,
            resources,
            shutdown,
            reports: Vec::new(),
        }
    }

    fn live(&self) -> usize {
        self.retire.len()
    }

    fn spawned(&self) -> usize {
        (self.next_id - 1) as usize
    }

    fn spawn(&mut self) {
        let id = WorkerId::numbered(self.next_id);
        self.next_id += 1;
        let token = self.shutdown.child_token();
        let worker = Worker::new(id.clone(), self.resources.clone(), token.clone());
        let handle = self.tasks.spawn(worker.run());
        self.ids.insert(handle.id(), id.clone());
        self.retire.push((id, token));
    }

    /// Spawn or retire workers until `target` are live.
    fn resize(&mut self, target: usize) {
        let live = self.live();
        if target > live {
            for _ in live..target {
                self.spawn();
            }
            info!(from = live, to = target, "Spawned workers");
        } else if target < live {
            for _ in target..live {
                if let Some((id, token)) = self.retire.pop() {
                    info!(worker_id = %id, "Retiring worker");
                    token.cancel();
                }
            }
        }
    }

    /// Record a finished worker task.
    fn finished(
        &mut self,
        joined: Result<(tokio::task::Id, WorkerReport), tokio::task::JoinError>,
    ) {
        let task_id = match &joined {
            Ok((task_id, _)) => *task_id,
            Err(e) => e.id(),
        };
        if let Some(worker_id) = self.ids.remove(&task_id) {
            self.retire.retain(|(w, _)| *w != worker_id);
        }
        match joined {
            Ok((_, report)) => self.reports.push(report),
            Err(e) if e.is_cancelled() => warn!("Worker aborted"),
            Err(e) => error!(error = %e, "Worker task failed"),
        }
    }

    async fn join_all(&mut self) {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.finished(joined);
        }
    }
}

/// Drives one crawl run.
pub struct Orchestrator {
    config: EngineConfig,
    driver: Arc<dyn BrowserDriver>,
    discovery: Arc<dyn Discovery>,
    shutdown: CancellationToken,
    events: EventBus,
}

impl Orchestrator {
    /// Validate `config` and prepare a run. Fails before anything starts if
    /// the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        driver: Arc<dyn BrowserDriver>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let events = EventBus::new(config.observability.clone());
        Ok(Self {
            config,
            driver,
            discovery,
            shutdown: CancellationToken::new(),
            events,
        })
    }

    /// Token that stops the run gracefully when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Event bus of this run. Subscribe before calling [`run`](Self::run) to
    /// see every event.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run the crawl to completion (or until shutdown) and return the report.
    ///
    /// Only configuration and root discovery failures are errors; per-task
    /// failures end up in the report.
    pub async fn run(self) -> Result<CrawlReport, EngineError> {
        let started = Instant::now();
        let config = &self.config;
        info!(
            min_workers = config.workers.min_workers,
            max_workers = config.workers.max_workers,
            initial_workers = config.workers.initial_workers,
            pool_size = config.pool.size,
            "Starting crawl"
        );

        let ctx = Arc::new(WorkerContext::with_shutdown(self.shutdown.clone()));
        let pool = BrowserPool::new(self.driver.clone(), config.pool.clone());
        let tracker = Tracker::new(&config.tracking);
        let telemetry = Arc::new(Telemetry::new(config.scaling.rate_window));
        let retry = RetryPolicy::new(&config.retry);

        let roots = match self.discover_roots(&pool, &retry).await {
            Ok(roots) => roots,
            Err(e) => {
                pool.close_all().await;
                return Err(e);
            }
        };
        if roots.is_empty() {
            warn!("No root nodes found");
        } else {
            info!(roots = roots.len(), "Root nodes discovered");
        }
        for node in roots {
            ctx.enqueue(Task::root(node))?;
        }

        let resources = Arc::new(WorkerResources {
            ctx: ctx.clone(),
            pool: pool.clone(),
            discovery: self.discovery.clone(),
            tracker: tracker.clone(),
            retry,
            events: self.events.clone(),
            telemetry: telemetry.clone(),
            config: config.workers.clone(),
        });
        let mut workers = WorkerSet::new(resources, self.shutdown.clone());
        workers.resize(config.workers.initial_workers);

        let background = self.shutdown.child_token();
        let (target_tx, mut target_rx) = watch::channel(config.workers.initial_workers);
        let scaling: Option<JoinHandle<ScalingReport>> = if config.scaling.enabled {
            let mut engine = ScalingEngine::new(
                &config.scaling,
                &config.workers,
                ctx.clone(),
                telemetry.clone(),
                pool.clone(),
                self.events.clone(),
            );
            if config.scaling.resource_limits.enabled {
                engine = engine.with_resource_monitor(Arc::new(SystemMonitor::new()));
            }
            Some(tokio::spawn(engine.run(target_tx, background.clone())))
        } else {
            drop(target_tx);
            None
        };
        let pool_ticker = self.spawn_pool_status(&pool, background.clone());

        let mut follow_target = scaling.is_some();
        let stop = loop {
            tokio::select! {
                _ = ctx.wait_drained() => break StopReason::Drained,
                _ = self.shutdown.cancelled() => break StopReason::Shutdown,
                changed = target_rx.changed(), if follow_target => {
                    if changed.is_ok() {
                        let target = *target_rx.borrow_and_update();
                        workers.resize(target);
                    } else {
                        follow_target = false;
                    }
                }
                Some(joined) = workers.tasks.join_next_with_id() => {
                    let panicked = joined.is_err();
                    workers.finished(joined);
                    if panicked {
                        // Keep the worker count at target.
                        let target = *target_rx.borrow();
                        workers.resize(target);
                    }
                }
            }
        };

        match stop {
            StopReason::Drained => info!("All tasks finished, shutting down"),
            StopReason::Shutdown => warn!("Shutdown requested, stopping crawl"),
        }
        ctx.signal_shutdown();

        let grace = config.workers.shutdown_timeout;
        if tokio::time::timeout(grace, workers.join_all()).await.is_err() {
            warn!(
                remaining = workers.tasks.len(),
                timeout = ?grace,
                "Workers did not stop in time, aborting"
            );
            workers.tasks.abort_all();
            workers.join_all().await;
        }

        background.cancel();
        let scaling_history = match scaling {
            Some(handle) => match handle.await {
                Ok(report) => report.history,
                Err(e) => {
                    error!(error = %e, "Scaling engine failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if let Some(handle) = pool_ticker {
            let _ = handle.await;
        }
        pool.close_all().await;

        let results = ctx.results();
        let outcome = match stop {
            StopReason::Shutdown => CrawlOutcome::Interrupted,
            StopReason::Drained if results.failed.is_empty() => CrawlOutcome::Completed,
            StopReason::Drained => CrawlOutcome::CompletedWithFailures,
        };
        let report = CrawlReport {
            outcome,
            completed: results.completed,
            failed: results.failed,
            statistics: tracker.get_tracking_statistics(),
            hierarchy: tracker.forest(),
            counters: ctx.snapshot(),
            telemetry: telemetry.totals(),
            pool: pool.status(),
            workers_spawned: workers.spawned(),
            workers: workers.reports,
            scaling_history,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        info!(
            outcome = ?report.outcome,
            completed = report.completed.len(),
            failed = report.failed.len(),
            elapsed_secs = report.elapsed_secs,
            "Crawl finished"
        );
        Ok(report)
    }

    /// Find the root nodes, retrying with the task retry policy.
    async fn discover_roots(
        &self,
        pool: &BrowserPool,
        retry: &RetryPolicy,
    ) -> Result<Vec<NodeInfo>, EngineError> {
        let mut retries = 0;
        loop {
            let attempt = match pool.acquire().await {
                Ok(mut lease) => {
                    let found = self.discovery.discover_roots(&mut lease).await;
                    let page_ok = match &found {
                        Ok(_) => true,
                        Err(e) => e.class() == FailureClass::Structural,
                    };
                    pool.release(lease, page_ok).await;
                    found
                }
                Err(e) => Err(e),
            };

            let err = match attempt {
                Ok(roots) => return Ok(roots),
                Err(e) => e,
            };
            match retry.decide_attempt(retries, &err) {
                RetryDecision::Retry { delay, attempt } => {
                    warn!(attempt, delay = ?delay, error = %err, "Root discovery failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(EngineError::Discovery(err)),
                    }
                    retries = attempt;
                }
                RetryDecision::Fail => {
                    error!(retries, error = %err, "Root discovery failed");
                    return Err(EngineError::Discovery(err));
                }
            }
        }
    }

    fn spawn_pool_status(
        &self,
        pool: &BrowserPool,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.config.observability.is_enabled(EventCategory::PoolStatus) {
            return None;
        }
        let pool = pool.clone();
        let events = self.events.clone();
        let every = self.config.observability.pool_status_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let status = pool.status();
                events.publish(CrawlEvent::pool_status(
                    status.size,
                    status.checked_out,
                    status.idle,
                    status.circuit,
                ));
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ConfigError, WorkerConfig};
    use crate::test_support::{FakeTree, ScriptedDriver};
    use treecrawl_core::{EventKind, TaskError, TaskStatus};

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.workers = WorkerConfig {
            min_workers: 1,
            max_workers: 4,
            initial_workers: 2,
            dequeue_timeout: Duration::from_millis(100),
            ..WorkerConfig::default()
        };
        config.pool.size = 4;
        config.scaling.resource_limits.enabled = false;
        config
    }

    fn orchestrator(config: EngineConfig, tree: FakeTree) -> Orchestrator {
        Orchestrator::new(config, ScriptedDriver::new(), tree.into_arc()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_roots_two_children_each() {
        let report = orchestrator(config(), FakeTree::uniform(3, 2))
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, CrawlOutcome::Completed);
        assert_eq!(report.completed.len(), 9);
        assert!(report.failed.is_empty());
        assert_eq!(report.statistics.tasks.total, 9);
        assert_eq!(report.statistics.tasks.completed, 9);
        assert_eq!(report.statistics.hierarchy.root_tasks, 3);
        assert_eq!(report.hierarchy.len(), 3);
        for root in &report.hierarchy {
            assert_eq!(root.children.len(), 2);
            assert_eq!(root.rollup.completed, 2);
            assert!(root.children.iter().all(|c| c.status == TaskStatus::Completed));
        }

        let c = &report.counters;
        assert_eq!(c.total_created, 9);
        assert_eq!(c.completed + c.failed + c.active + c.pending(), 9);
        assert_eq!(report.pool.checked_out, 0);
        assert_eq!(report.pool.live, 0);
        assert!(!report.workers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_reported() {
        let tree = FakeTree::uniform(1, 2).fail("R0 > C1", TaskError::Structural("bad".into()), 1);
        let report = orchestrator(config(), tree).run().await.unwrap();

        assert_eq!(report.outcome, CrawlOutcome::CompletedWithFailures);
        assert_eq!(report.completed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        let failure = report.failed.values().next().unwrap();
        assert_eq!(failure.path, "R0 > C1");
        assert_eq!(failure.class, FailureClass::Structural);
        assert_eq!(report.statistics.tasks.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover() {
        let tree = FakeTree::uniform(2, 1).fail("R1", TaskError::TransientIo("reset".into()), 2);
        let report = orchestrator(config(), tree).run().await.unwrap();

        assert_eq!(report.outcome, CrawlOutcome::Completed);
        assert_eq!(report.completed.len(), 4);
        assert_eq!(report.counters.total_retries, 2);
        assert_eq!(report.telemetry.failed_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_discovery_still_finishes() {
        let tree = FakeTree::new().root("A").root("B").panic_on("B");
        let run = orchestrator(config(), tree).run();
        let report = tokio::time::timeout(Duration::from_secs(3600), run)
            .await
            .expect("run should finish")
            .unwrap();

        assert_eq!(report.outcome, CrawlOutcome::CompletedWithFailures);
        assert_eq!(report.completed.len(), 1);
        let failure = report.failed.values().next().unwrap();
        assert_eq!(failure.path, "B");
        assert_eq!(failure.class, FailureClass::Structural);
        assert_eq!(report.pool.checked_out, 0);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = config();
        config.workers.min_workers = 5;
        config.workers.max_workers = 2;
        let err = Orchestrator::new(config, ScriptedDriver::new(), FakeTree::new().into_arc())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::WorkerBounds { min: 5, max: 2 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_discovery_failure_is_fatal() {
        let tree = FakeTree::uniform(1, 1).fail_roots(TaskError::TransientIo("down".into()), 10);
        let err = orchestrator(config(), tree).run().await.unwrap_err();
        assert!(matches!(err, EngineError::Discovery(TaskError::TransientIo(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_discovery_retries() {
        let tree = FakeTree::uniform(1, 1).fail_roots(TaskError::TransientIo("slow".into()), 2);
        let report = orchestrator(config(), tree).run().await.unwrap();
        assert_eq!(report.completed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_roots_finishes_empty() {
        let report = orchestrator(config(), FakeTree::new()).run().await.unwrap();
        assert_eq!(report.outcome, CrawlOutcome::Completed);
        assert!(report.completed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_disabled() {
        let mut config = config();
        config.tracking.enabled = false;
        let report = orchestrator(config, FakeTree::uniform(3, 2)).run().await.unwrap();

        assert_eq!(report.completed.len(), 9);
        assert_eq!(report.statistics, TrackingStatistics::default());
        assert!(report.hierarchy.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_run() {
        let tree = FakeTree::uniform(4, 3).with_delay(Duration::from_secs(20));
        let orch = orchestrator(config(), tree);
        let shutdown = orch.shutdown_handle();
        let run = tokio::spawn(orch.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.outcome, CrawlOutcome::Interrupted);
        assert!(report.completed.is_empty());
        // In-flight tasks were aborted after the grace period.
        assert!(report.workers.is_empty());
        assert_eq!(report.workers_spawned, 2);
        assert!(report
            .to_prometheus()
            .contains("treecrawl_workers_spawned_total 2"));
        assert_eq!(report.pool.checked_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_task_events() {
        let mut config = config();
        config.scaling.enabled = false;
        let orch = orchestrator(config, FakeTree::uniform(1, 1));
        let mut rx = orch.events().subscribe();
        orch.run().await.unwrap();

        let mut started = 0;
        let mut completed = 0;
        while let Ok(event) = rx.try_recv() {
            match event.kind {
                EventKind::TaskStarted { .. } => started += 1,
                EventKind::TaskCompleted { .. } => completed += 1,
                _ => {}
            }
        }
        assert_eq!(started, 2);
        assert_eq!(completed, 2);
    }
}
