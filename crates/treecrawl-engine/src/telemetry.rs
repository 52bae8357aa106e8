//! Run telemetry: sliding-window rates for the scaling engine and
//! Prometheus text rendering of a finished (or running) crawl.

use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use treecrawl_core::{CircuitState, FailureClass};

use crate::context::ContextSnapshot;
use crate::pool::PoolStatus;

/// Rates observed over the telemetry window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TelemetryRates {
    pub completions: usize,
    pub failures: usize,
    pub exhaustion_events: usize,
    /// Completions per second.
    pub completion_rate: f64,
    /// Failed attempts over all finished attempts, in `[0, 1]`.
    pub error_rate: f64,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryTotals {
    pub completions: u64,
    /// Failed attempts, retried or not.
    pub failed_attempts: u64,
    pub transient_failures: u64,
    pub structural_failures: u64,
    pub exhaustion_events: u64,
}

#[derive(Debug, Default)]
struct Window {
    completions: VecDeque<Instant>,
    failures: VecDeque<Instant>,
    exhaustion: VecDeque<Instant>,
    totals: TelemetryTotals,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        for events in [&mut self.completions, &mut self.failures, &mut self.exhaustion] {
            while events
                .front()
                .is_some_and(|at| now.duration_since(*at) > window)
            {
                events.pop_front();
            }
        }
    }
}

/// Sliding-window event counters shared by workers and the scaling engine.
#[derive(Debug)]
pub struct Telemetry {
    window: Duration,
    inner: Mutex<Window>,
}

impl Telemetry {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Window::default()),
        }
    }

    pub fn record_completion(&self) {
        let mut inner = self.inner.lock();
        inner.completions.push_back(Instant::now());
        inner.totals.completions += 1;
    }

    /// Record one failed attempt. Exhaustion failures also count as a pool
    /// pressure signal.
    pub fn record_failure(&self, class: FailureClass) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures.push_back(now);
        inner.totals.failed_attempts += 1;
        match class {
            FailureClass::TransientIo => inner.totals.transient_failures += 1,
            FailureClass::Structural => inner.totals.structural_failures += 1,
            FailureClass::ResourceExhaustion => {
                inner.exhaustion.push_back(now);
                inner.totals.exhaustion_events += 1;
            }
        }
    }

    pub fn rates(&self) -> TelemetryRates {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now, self.window);

        let completions = inner.completions.len();
        let failures = inner.failures.len();
        let attempts = completions + failures;
        TelemetryRates {
            completions,
            failures,
            exhaustion_events: inner.exhaustion.len(),
            completion_rate: completions as f64 / self.window.as_secs_f64().max(f64::EPSILON),
            error_rate: if attempts == 0 {
                0.0
            } else {
                failures as f64 / attempts as f64
            },
        }
    }

    pub fn totals(&self) -> TelemetryTotals {
        self.inner.lock().totals
    }
}

/// Render run counters in Prometheus text exposition format.
pub fn render_prometheus(
    counters: &ContextSnapshot,
    pool: &PoolStatus,
    totals: &TelemetryTotals,
    workers_spawned: usize,
) -> String {
    let mut output = String::new();

    write_task_metrics(counters, &mut output);
    write_failure_metrics(totals, &mut output);
    write_pool_metrics(pool, &mut output);

    writeln!(output).ok();
    writeln!(output, "# HELP treecrawl_workers_spawned_total Workers spawned during the run").ok();
    writeln!(output, "# TYPE treecrawl_workers_spawned_total counter").ok();
    writeln!(output, "treecrawl_workers_spawned_total {workers_spawned}").ok();

    output
}

fn write_task_metrics(counters: &ContextSnapshot, output: &mut String) {
    writeln!(output, "# HELP treecrawl_tasks Number of tasks by state").ok();
    writeln!(output, "# TYPE treecrawl_tasks gauge").ok();
    writeln!(output, "treecrawl_tasks{{state=\"queued\"}} {}", counters.queue_depth).ok();
    writeln!(output, "treecrawl_tasks{{state=\"retrying\"}} {}", counters.delayed_retries).ok();
    writeln!(output, "treecrawl_tasks{{state=\"active\"}} {}", counters.active).ok();
    writeln!(output, "treecrawl_tasks{{state=\"completed\"}} {}", counters.completed).ok();
    writeln!(output, "treecrawl_tasks{{state=\"failed\"}} {}", counters.failed).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP treecrawl_tasks_created_total Tasks created since the run started"
    )
    .ok();
    writeln!(output, "# TYPE treecrawl_tasks_created_total counter").ok();
    writeln!(output, "treecrawl_tasks_created_total {}", counters.total_created).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP treecrawl_retries_total Retries scheduled").ok();
    writeln!(output, "# TYPE treecrawl_retries_total counter").ok();
    writeln!(output, "treecrawl_retries_total {}", counters.total_retries).ok();
}

fn write_failure_metrics(totals: &TelemetryTotals, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP treecrawl_failed_attempts_total Failed task attempts by class").ok();
    writeln!(output, "# TYPE treecrawl_failed_attempts_total counter").ok();
    writeln!(
        output,
        "treecrawl_failed_attempts_total{{class=\"transient_io\"}} {}",
        totals.transient_failures
    )
    .ok();
    writeln!(
        output,
        "treecrawl_failed_attempts_total{{class=\"structural\"}} {}",
        totals.structural_failures
    )
    .ok();
    writeln!(
        output,
        "treecrawl_failed_attempts_total{{class=\"resource_exhaustion\"}} {}",
        totals.exhaustion_events
    )
    .ok();
}

fn write_pool_metrics(pool: &PoolStatus, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP treecrawl_pool_pages Browser pages by state").ok();
    writeln!(output, "# TYPE treecrawl_pool_pages gauge").ok();
    writeln!(output, "treecrawl_pool_pages{{state=\"checked_out\"}} {}", pool.checked_out).ok();
    writeln!(output, "treecrawl_pool_pages{{state=\"idle\"}} {}", pool.idle).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP treecrawl_pool_pages_created_total Browser pages opened").ok();
    writeln!(output, "# TYPE treecrawl_pool_pages_created_total counter").ok();
    writeln!(output, "treecrawl_pool_pages_created_total {}", pool.created).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP treecrawl_pool_pages_reused_total Acquisitions served by an idle page"
    )
    .ok();
    writeln!(output, "# TYPE treecrawl_pool_pages_reused_total counter").ok();
    writeln!(output, "treecrawl_pool_pages_reused_total {}", pool.reused).ok();

    let open = u8::from(pool.circuit == CircuitState::Open);
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP treecrawl_pool_circuit_open Whether the browser circuit breaker is open"
    )
    .ok();
    writeln!(output, "# TYPE treecrawl_pool_circuit_open gauge").ok();
    writeln!(output, "treecrawl_pool_circuit_open {open}").ok();
}
