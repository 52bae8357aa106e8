//! treecrawl CLI - crawl a (simulated) documentation tree.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use treecrawl_engine::config::ResourcePolicy;
use treecrawl_engine::{
    spawn_subscriber, CrawlOutcome, CrawlReport, EngineConfig, LogSubscriber, Orchestrator,
};

mod simulated;

use simulated::{simulate, SiteConfig};

/// treecrawl - hierarchical documentation tree crawler
#[derive(Parser, Debug)]
#[command(name = "treecrawl")]
#[command(about = "Crawl a documentation tree with an adaptive worker pool", long_about = None)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the full report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Print run metrics in Prometheus text format on stdout
    #[arg(long)]
    metrics: bool,

    /// Log every observability event
    #[arg(long)]
    events: bool,

    /// Lower bound for the worker count
    #[arg(long, default_value = "20")]
    min_workers: usize,

    /// Upper bound for the worker count
    #[arg(long, default_value = "100")]
    max_workers: usize,

    /// Workers spawned at start
    #[arg(long, default_value = "50")]
    initial_workers: usize,

    /// Keep the worker count fixed at --initial-workers
    #[arg(long)]
    no_scaling: bool,

    /// Let the scaling engine ignore host memory, CPU and disk load
    #[arg(long)]
    no_resource_gating: bool,

    /// Seconds between scaling decisions
    #[arg(long, default_value = "5")]
    scaling_interval_secs: u64,

    /// Retries per task before it fails permanently
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Base retry delay in milliseconds
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// Multiplier applied to the retry delay per attempt
    #[arg(long, default_value = "2.0")]
    backoff_multiplier: f64,

    /// Maximum number of open browser pages
    #[arg(long, default_value = "15")]
    pool_size: usize,

    /// Page load timeout in seconds
    #[arg(long, default_value = "30")]
    page_timeout_secs: u64,

    /// DOM operation timeout in seconds
    #[arg(long, default_value = "15")]
    dom_timeout_secs: u64,

    /// Consecutive browser failures that open the circuit breaker
    #[arg(long, default_value = "5")]
    circuit_threshold: u32,

    /// Nodes at this depth are recorded but not expanded
    #[arg(long, default_value = "999")]
    max_depth: u32,

    /// Disable hierarchical task tracking
    #[arg(long)]
    no_tracking: bool,

    /// Base URL of the simulated site
    #[arg(long, default_value = "https://docs.example.com/")]
    base_url: Url,

    /// Number of root nodes in the simulated site
    #[arg(long, default_value = "5")]
    roots: usize,

    /// Number of tree levels in the simulated site, roots included
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..))]
    depth: u32,

    /// Children per expandable node in the simulated site
    #[arg(long, default_value = "4")]
    fanout: usize,

    /// Probability that a simulated page operation fails
    #[arg(long, default_value = "0.05", value_parser = parse_rate)]
    failure_rate: f64,

    /// Mean latency of a simulated page operation in milliseconds
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// Seed for the simulated site
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not within [0, 1]"))
    }
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();

        config.workers.min_workers = self.min_workers;
        config.workers.max_workers = self.max_workers;
        config.workers.initial_workers = self.initial_workers;
        config.workers.max_depth = self.max_depth;

        config.retry.max_retries = self.max_retries;
        config.retry.delay_base = Duration::from_millis(self.retry_delay_ms);
        config.retry.backoff_multiplier = self.backoff_multiplier;

        config.pool.size = self.pool_size;
        config.pool.page_load_timeout = Duration::from_secs(self.page_timeout_secs);
        config.pool.dom_operation_timeout = Duration::from_secs(self.dom_timeout_secs);
        config.pool.circuit.failure_threshold = self.circuit_threshold;
        if let Some(host) = self.base_url.host_str() {
            config.pool.resource_policy = ResourcePolicy::default().allow_domain(host);
        }

        config.scaling.enabled = !self.no_scaling;
        config.scaling.interval = Duration::from_secs(self.scaling_interval_secs);
        config.scaling.resource_limits.enabled = !self.no_resource_gating;
        config.tracking.enabled = !self.no_tracking;

        config
    }

    fn site_config(&self) -> SiteConfig {
        SiteConfig {
            base_url: self.base_url.clone(),
            roots: self.roots,
            depth: self.depth,
            fanout: self.fanout,
            failure_rate: self.failure_rate,
            latency: Duration::from_millis(self.latency_ms),
            seed: self.seed,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(CrawlOutcome::Completed) => ExitCode::SUCCESS,
        Ok(CrawlOutcome::CompletedWithFailures | CrawlOutcome::Interrupted) => ExitCode::from(1),
        Err(e) => {
            error!(error = %e, "Crawl aborted");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<CrawlOutcome, Box<dyn std::error::Error>> {
    let site = cli.site_config();
    info!(
        base_url = %site.base_url,
        nodes = site.node_count(),
        failure_rate = site.failure_rate,
        "Starting treecrawl against simulated site"
    );
    let (driver, discovery) = simulate(site);
    let orchestrator = Orchestrator::new(cli.engine_config(), driver, discovery)?;

    let subscriber_cancel = CancellationToken::new();
    let subscriber = cli
        .events
        .then(|| spawn_subscriber(orchestrator.events(), LogSubscriber, subscriber_cancel.clone()));

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    let report = orchestrator.run().await;
    subscriber_cancel.cancel();
    if let Some(handle) = subscriber {
        let _ = handle.await;
    }
    let report = report?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    if cli.metrics {
        print!("{}", report.to_prometheus());
    }

    Ok(report.outcome)
}

fn print_summary(report: &CrawlReport) {
    let stats = &report.statistics;
    println!("Crawl {}", outcome_name(report.outcome));
    println!("  Completed:  {}", report.completed.len());
    println!("  Failed:     {}", report.failed.len());
    println!("  Retries:    {}", report.counters.total_retries);
    println!("  Workers:    {} spawned", report.workers_spawned);
    println!("  Pages:      {} opened, {} reused", report.pool.created, report.pool.reused);
    println!("  Elapsed:    {:.1}s", report.elapsed_secs);

    if !stats.by_depth.is_empty() {
        println!();
        println!("{:<6}  {:>9}  {:>6}", "DEPTH", "COMPLETED", "FAILED");
        println!("{}", "-".repeat(25));
        for (depth, counts) in &stats.by_depth {
            println!("{:<6}  {:>9}  {:>6}", depth, counts.completed, counts.failed);
        }
    }

    if !report.failed.is_empty() {
        println!();
        println!("Failures:");
        let mut failures: Vec<_> = report.failed.values().collect();
        failures.sort_by(|a, b| a.path.cmp(&b.path));
        for failure in failures {
            println!(
                "  {} ({:?}, {} retries): {}",
                failure.path, failure.class, failure.retry_count, failure.error
            );
        }
    }
}

fn outcome_name(outcome: CrawlOutcome) -> &'static str {
    match outcome {
        CrawlOutcome::Completed => "completed",
        CrawlOutcome::CompletedWithFailures => "completed with failures",
        CrawlOutcome::Interrupted => "interrupted",
    }
}
