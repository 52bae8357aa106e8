//! Adaptive worker scaling.
//!
//! [`ScalingPolicy`] is a pure step function from a metrics sample to a
//! worker-count target. [`ScalingEngine`] samples the run on a fixed interval,
//! applies the policy and publishes the target on a `watch` channel; it is
//! the only writer of that channel. The orchestrator reacts to target
//! changes by spawning or retiring workers.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use treecrawl_core::{CircuitState, CrawlEvent, ScalingAction};

use crate::config::{ScalingConfig, WorkerConfig};
use crate::context::WorkerContext;
use crate::events::EventBus;
use crate::pool::BrowserPool;
use crate::resources::{ResourceMonitor, ResourceSample};
use crate::telemetry::Telemetry;

/// Metrics observed at one scaling interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalingSample {
    /// Tasks in the queue, delayed retries excluded.
    pub queue_depth: usize,
    /// Queue plus delayed retries.
    pub pending: usize,
    pub workers: usize,
    pub busy_workers: usize,
    /// Completions per second over the telemetry window.
    pub completion_rate: f64,
    pub error_rate: f64,
    pub exhaustion_events: usize,
    pub circuit_open: bool,
    /// Host utilisation, when a resource monitor is attached.
    pub resources: Option<ResourceSample>,
}

impl ScalingSample {
    pub fn idle_ratio(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        self.workers.saturating_sub(self.busy_workers) as f64 / self.workers as f64
    }
}

/// One scaling decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub current: usize,
    pub target: usize,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Worker-count step function with bounds and a minimum dwell between
/// decisions in opposite directions.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    config: ScalingConfig,
    min_workers: usize,
    max_workers: usize,
    last_move: Option<(ScalingAction, Instant)>,
}

impl ScalingPolicy {
    pub fn new(config: &ScalingConfig, workers: &WorkerConfig) -> Self {
        Self {
            config: config.clone(),
            min_workers: workers.min_workers,
            max_workers: workers.max_workers,
            last_move: None,
        }
    }

    pub fn decide(&mut self, sample: &ScalingSample, now: Instant) -> ScalingDecision {
        let current = sample.workers;
        let (action, reason) = self.step(sample);
        let target = match action {
            ScalingAction::ScaleUp => current.saturating_add(self.config.scale_up_step),
            ScalingAction::ScaleDown => current.saturating_sub(self.config.scale_down_step),
            ScalingAction::Hold => current,
        }
        .clamp(self.min_workers, self.max_workers);

        let (action, reason) = if action != ScalingAction::Hold && target == current {
            (ScalingAction::Hold, format!("{reason}; already at worker bound"))
        } else if self.within_dwell(action, now) {
            (
                ScalingAction::Hold,
                format!("{reason}; direction change suppressed during dwell"),
            )
        } else {
            (action, reason)
        };

        let target = if action == ScalingAction::Hold {
            current
        } else {
            self.last_move = Some((action, now));
            target
        };

        ScalingDecision {
            action,
            current,
            target,
            reason,
            at: Utc::now(),
        }
    }

    fn step(&self, sample: &ScalingSample) -> (ScalingAction, String) {
        let cfg = &self.config;

        let limits = &cfg.resource_limits;
        let host = sample.resources.filter(|_| limits.enabled);

        if sample.circuit_open {
            return (ScalingAction::ScaleDown, "browser circuit open".to_string());
        }
        if let Some(pressure) = host.and_then(|r| r.pressure(limits)) {
            return (ScalingAction::ScaleDown, format!("host under pressure: {pressure}"));
        }
        if sample.exhaustion_events > 0 {
            return (
                ScalingAction::ScaleDown,
                format!("{} pool exhaustion events", sample.exhaustion_events),
            );
        }
        if sample.error_rate >= cfg.error_rate_threshold && sample.error_rate > 0.0 {
            return (
                ScalingAction::ScaleDown,
                format!(
                    "error rate {:.2} at or above {:.2}",
                    sample.error_rate, cfg.error_rate_threshold
                ),
            );
        }

        let backlog_limit = cfg.scale_up_backlog_per_worker * sample.workers as f64;
        if sample.queue_depth > 0 && sample.queue_depth as f64 >= backlog_limit {
            let interval = cfg.interval.as_secs_f64();
            let drains_in_time = sample.completion_rate > 0.0
                && sample.queue_depth as f64 / sample.completion_rate <= interval;
            if !drains_in_time {
                let reason = format!(
                    "backlog of {} tasks for {} workers",
                    sample.queue_depth, sample.workers
                );
                if host.is_some_and(|r| !r.permits_growth(limits)) {
                    return (
                        ScalingAction::Hold,
                        format!("{reason}; growth vetoed by host load"),
                    );
                }
                return (ScalingAction::ScaleUp, reason);
            }
        }

        if sample.pending == 0 && sample.idle_ratio() >= cfg.idle_ratio_threshold {
            return (
                ScalingAction::ScaleDown,
                format!("queue empty, {:.0}% of workers idle", sample.idle_ratio() * 100.0),
            );
        }

        (ScalingAction::Hold, "within thresholds".to_string())
    }

    fn within_dwell(&self, action: ScalingAction, now: Instant) -> bool {
        match self.last_move {
            Some((last, at)) if action != ScalingAction::Hold && last != action => {
                now.saturating_duration_since(at) < self.config.min_dwell
            }
            _ => false,
        }
    }
}

/// Why the scaling loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingStop {
    Shutdown,
    /// The run stayed drained for longer than the stagnation window.
    Stagnated,
}

/// Result of a scaling loop.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingReport {
    pub stop: ScalingStop,
    pub history: Vec<ScalingDecision>,
}

/// Periodic sampler driving [`ScalingPolicy`].
pub struct ScalingEngine {
    policy: ScalingPolicy,
    config: ScalingConfig,
    ctx: Arc<WorkerContext>,
    telemetry: Arc<Telemetry>,
    pool: BrowserPool,
    events: EventBus,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    history: VecDeque<ScalingDecision>,
}

impl ScalingEngine {
    pub fn new(
        config: &ScalingConfig,
        workers: &WorkerConfig,
        ctx: Arc<WorkerContext>,
        telemetry: Arc<Telemetry>,
        pool: BrowserPool,
        events: EventBus,
    ) -> Self {
        Self {
            policy: ScalingPolicy::new(config, workers),
            config: config.clone(),
            ctx,
            telemetry,
            pool,
            events,
            monitor: None,
            history: VecDeque::with_capacity(config.history_size),
        }
    }

    /// Gate decisions on host utilisation read from `monitor`.
    pub fn with_resource_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn sample(&self, workers: usize) -> ScalingSample {
        let snapshot = self.ctx.snapshot();
        let rates = self.telemetry.rates();
        ScalingSample {
            queue_depth: snapshot.queue_depth,
            pending: snapshot.pending(),
            workers,
            busy_workers: snapshot.active.min(workers),
            completion_rate: rates.completion_rate,
            error_rate: rates.error_rate,
            exhaustion_events: rates.exhaustion_events,
            circuit_open: self.pool.circuit_state() == CircuitState::Open,
            resources: self.monitor.as_ref().and_then(|m| m.sample()),
        }
    }

    /// Run until `shutdown` fires or the run stagnates. The current worker
    /// count is read back from `target`.
    pub async fn run(
        mut self,
        target: watch::Sender<usize>,
        shutdown: CancellationToken,
    ) -> ScalingReport {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut drained_since: Option<Instant> = None;
        info!(interval = ?self.config.interval, "Scaling engine started");

        let stop = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break ScalingStop::Shutdown,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if self.ctx.is_drained() {
                let since = *drained_since.get_or_insert(now);
                if now.duration_since(since) >= self.config.stagnation_window {
                    break ScalingStop::Stagnated;
                }
            } else {
                drained_since = None;
            }

            let current = *target.borrow();
            let sample = self.sample(current);
            let decision = self.policy.decide(&sample, now);

            if decision.action == ScalingAction::Hold {
                debug!(workers = current, reason = %decision.reason, "Scaling hold");
            } else {
                info!(
                    action = ?decision.action,
                    current = decision.current,
                    target = decision.target,
                    reason = %decision.reason,
                    "Scaling workers"
                );
                target.send_replace(decision.target);
            }
            self.events.publish(CrawlEvent::scaling_decision(
                decision.action,
                decision.current,
                decision.target,
                decision.reason.clone(),
            ));

            if self.history.len() == self.config.history_size {
                self.history.pop_front();
            }
            if self.config.history_size > 0 {
                self.history.push_back(decision);
            }
        };

        info!(stop = ?stop, decisions = self.history.len(), "Scaling engine stopped");
        ScalingReport {
            stop,
            history: self.history.into(),
        }
    }
}
