//! Engine configuration.
//!
//! Configuration is immutable for the duration of a run. Defaults mirror the
//! values the crawler was tuned with against large documentation trees.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use treecrawl_core::EventCategory;

/// Invalid configuration. Fatal: the run aborts before any worker starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("min_workers ({min}) must not exceed max_workers ({max})")]
    WorkerBounds { min: usize, max: usize },

    #[error("initial_workers ({initial}) must lie within [{min}, {max}]")]
    InitialWorkers {
        initial: usize,
        min: usize,
        max: usize,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Complete configuration for one crawl run.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub scaling: ScalingConfig,
    pub observability: ObservabilityConfig,
    pub tracking: TrackingConfig,
}

impl EngineConfig {
    /// Check every section. Called by the orchestrator before anything runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.workers;
        if w.min_workers == 0 {
            return Err(ConfigError::invalid("min_workers", "at least one worker is required"));
        }
        if w.min_workers > w.max_workers {
            return Err(ConfigError::WorkerBounds {
                min: w.min_workers,
                max: w.max_workers,
            });
        }
        if w.initial_workers < w.min_workers || w.initial_workers > w.max_workers {
            return Err(ConfigError::InitialWorkers {
                initial: w.initial_workers,
                min: w.min_workers,
                max: w.max_workers,
            });
        }
        if w.dequeue_timeout.is_zero() {
            return Err(ConfigError::invalid("dequeue_timeout", "must be non-zero"));
        }

        let r = &self.retry;
        if !(r.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("{} is below 1.0", r.backoff_multiplier),
            ));
        }
        if !r.backoff_multiplier.is_finite() {
            return Err(ConfigError::invalid("backoff_multiplier", "must be finite"));
        }
        if r.max_delay < r.delay_base {
            return Err(ConfigError::invalid(
                "retry.max_delay",
                format!("{:?} is below delay_base {:?}", r.max_delay, r.delay_base),
            ));
        }

        let p = &self.pool;
        if p.size == 0 {
            return Err(ConfigError::invalid("pool.size", "must be at least 1"));
        }
        if p.max_uses_per_entry == 0 {
            return Err(ConfigError::invalid("pool.max_uses_per_entry", "must be at least 1"));
        }
        if p.page_load_timeout.is_zero() || p.dom_operation_timeout.is_zero() {
            return Err(ConfigError::invalid("pool timeouts", "must be non-zero"));
        }
        if p.circuit.failure_threshold == 0 || p.circuit.recovery_successes == 0 {
            return Err(ConfigError::invalid(
                "pool.circuit",
                "thresholds must be at least 1",
            ));
        }

        let s = &self.scaling;
        if s.interval.is_zero() {
            return Err(ConfigError::invalid("scaling.interval", "must be non-zero"));
        }
        if s.scale_up_step == 0 || s.scale_down_step == 0 {
            return Err(ConfigError::invalid("scaling steps", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&s.error_rate_threshold)
            || !(0.0..=1.0).contains(&s.idle_ratio_threshold)
        {
            return Err(ConfigError::invalid(
                "scaling thresholds",
                "ratios must lie within [0, 1]",
            ));
        }
        if s.scale_up_backlog_per_worker <= 0.0 {
            return Err(ConfigError::invalid(
                "scaling.scale_up_backlog_per_worker",
                "must be positive",
            ));
        }
        s.resource_limits.validate()?;

        if self.observability.pool_status_interval.is_zero() {
            return Err(ConfigError::invalid(
                "observability.pool_status_interval",
                "must be non-zero",
            ));
        }
        if self.observability.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "observability.channel_capacity",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

/// Worker-count bounds and per-worker loop timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lower bound for the scaling engine.
    pub min_workers: usize,
    /// Upper bound for the scaling engine.
    pub max_workers: usize,
    /// Workers spawned when the run starts.
    pub initial_workers: usize,
    /// How long a worker waits on an empty queue before re-checking for drain.
    pub dequeue_timeout: Duration,
    /// Grace period for in-flight tasks once shutdown is signalled.
    pub shutdown_timeout: Duration,
    /// Nodes at this depth are recorded but not expanded.
    pub max_depth: u32,
    /// Upper bound on children spawned from one node.
    pub max_children_per_node: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_workers: 20,
            max_workers: 100,
            initial_workers: 50,
            dequeue_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_depth: 999,
            max_children_per_node: 100,
        }
    }
}

/// Retry/backoff settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_base: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Browser pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of pages alive (idle + checked out).
    pub size: usize,
    /// How long `acquire` waits for a free slot before reporting exhaustion.
    pub acquire_timeout: Duration,
    /// A page is closed after this many tasks instead of being reused.
    pub max_uses_per_entry: u32,
    /// Deadline for page navigation.
    pub page_load_timeout: Duration,
    /// Deadline for each DOM query.
    pub dom_operation_timeout: Duration,
    pub circuit: CircuitBreakerConfig,
    pub resource_policy: ResourcePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 15,
            acquire_timeout: Duration::from_secs(10),
            max_uses_per_entry: 50,
            page_load_timeout: Duration::from_secs(30),
            dom_operation_timeout: Duration::from_secs(15),
            circuit: CircuitBreakerConfig::default(),
            resource_policy: ResourcePolicy::default(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (within `window`) that trip the breaker.
    pub failure_threshold: u32,
    /// Failures older than this no longer count towards tripping.
    pub window: Duration,
    /// Consecutive successful fresh acquisitions that close the breaker again.
    pub recovery_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            recovery_successes: 3,
        }
    }
}

/// Kind of sub-resource a page requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Document,
    Script,
    Stylesheet,
    Image,
    Media,
    Font,
    Xhr,
    Other,
}

/// Declarative request filtering applied to every page the pool hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Resource types that are never loaded.
    pub blocked_resource_types: HashSet<ResourceType>,
    /// Hosts pages may navigate to. Empty allows every host.
    pub allowed_domains: Vec<String>,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            blocked_resource_types: [
                ResourceType::Image,
                ResourceType::Media,
                ResourceType::Font,
                ResourceType::Stylesheet,
                ResourceType::Other,
            ]
            .into_iter()
            .collect(),
            allowed_domains: Vec::new(),
        }
    }
}

impl ResourcePolicy {
    /// A policy that loads everything everywhere.
    pub fn permissive() -> Self {
        Self {
            blocked_resource_types: HashSet::new(),
            allowed_domains: Vec::new(),
        }
    }

    /// Builder method to restrict navigation to a domain (and its subdomains).
    pub fn allow_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_domains.push(domain.into());
        self
    }

    /// Whether a page may navigate to `url`.
    pub fn allows_navigation(&self, url: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        match parsed.host_str() {
            Some(host) => self.host_allowed(host),
            None => false,
        }
    }

    /// Whether a sub-resource request should be let through.
    ///
    /// Requests to hosts outside the allow-list never load. Documents and
    /// scripts from allowed hosts always do; other types load unless blocked.
    pub fn allows_request(&self, url: &str, resource_type: ResourceType) -> bool {
        if !self.allows_navigation(url) {
            return false;
        }
        if matches!(resource_type, ResourceType::Document | ResourceType::Script) {
            return true;
        }
        !self.blocked_resource_types.contains(&resource_type)
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_domains.iter().any(|domain| {
            host == domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// Adaptive scaling settings.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    /// Whether the scaling engine runs at all.
    pub enabled: bool,
    /// Sampling/decision interval.
    pub interval: Duration,
    /// Workers added by one scale-up decision.
    pub scale_up_step: usize,
    /// Workers retired by one scale-down decision.
    pub scale_down_step: usize,
    /// Queue depth per worker above which the engine grows.
    pub scale_up_backlog_per_worker: f64,
    /// Fraction of idle workers above which the engine shrinks an empty queue.
    pub idle_ratio_threshold: f64,
    /// Error rate above which the engine contracts protectively.
    pub error_rate_threshold: f64,
    /// Minimum time between decisions in opposite directions.
    pub min_dwell: Duration,
    /// Length of the sliding window used for rates.
    pub rate_window: Duration,
    /// The engine stops once the run has been drained for this long.
    pub stagnation_window: Duration,
    /// Number of decisions kept in the scaling history.
    pub history_size: usize,
    pub resource_limits: ResourceLimits,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            scale_up_step: 10,
            scale_down_step: 5,
            scale_up_backlog_per_worker: 2.0,
            idle_ratio_threshold: 0.5,
            error_rate_threshold: 0.2,
            min_dwell: Duration::from_secs(45),
            rate_window: Duration::from_secs(30),
            stagnation_window: Duration::from_secs(15),
            history_size: 100,
            resource_limits: ResourceLimits::default(),
        }
    }
}

/// Host load ceilings, in percent, consulted by the scaling engine.
///
/// Growth is vetoed unless every gauge is below its `scale_up_*` ceiling.
/// Any gauge above its `scale_down_*` ceiling forces a contraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub enabled: bool,
    pub scale_up_max_memory_percent: f64,
    pub scale_up_max_cpu_percent: f64,
    pub scale_up_max_disk_percent: f64,
    pub scale_down_memory_percent: f64,
    pub scale_down_cpu_percent: f64,
    pub scale_down_disk_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_up_max_memory_percent: 80.0,
            scale_up_max_cpu_percent: 85.0,
            scale_up_max_disk_percent: 90.0,
            scale_down_memory_percent: 90.0,
            scale_down_cpu_percent: 95.0,
            scale_down_disk_percent: 95.0,
        }
    }
}

impl ResourceLimits {
    fn validate(&self) -> Result<(), ConfigError> {
        let ceilings = [
            self.scale_up_max_memory_percent,
            self.scale_up_max_cpu_percent,
            self.scale_up_max_disk_percent,
            self.scale_down_memory_percent,
            self.scale_down_cpu_percent,
            self.scale_down_disk_percent,
        ];
        if !ceilings.iter().all(|c| (0.0..=100.0).contains(c)) {
            return Err(ConfigError::invalid(
                "scaling.resource_limits",
                "percentages must lie within [0, 100]",
            ));
        }
        Ok(())
    }
}

/// Which observability events are published, and how many are buffered.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub categories: HashSet<EventCategory>,
    /// Events buffered per subscriber; the oldest are dropped on overflow.
    pub channel_capacity: usize,
    /// How often the orchestrator publishes a pool status event.
    pub pool_status_interval: Duration,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            categories: EventCategory::ALL.into_iter().collect(),
            channel_capacity: 1024,
            pool_status_interval: Duration::from_secs(30),
        }
    }
}

impl ObservabilityConfig {
    /// A configuration that publishes nothing.
    pub fn disabled() -> Self {
        Self {
            categories: HashSet::new(),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self, category: EventCategory) -> bool {
        self.categories.contains(&category)
    }
}

/// Hierarchical task tracking toggle.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub enabled: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_min_above_max_is_fatal() {
        let mut config = EngineConfig::default();
        config.workers.min_workers = 10;
        config.workers.max_workers = 5;
        config.workers.initial_workers = 5;
        assert_eq!(
            config.validate(),
            Err(ConfigError::WorkerBounds { min: 10, max: 5 })
        );
    }

    #[test]
    fn test_initial_outside_bounds() {
        let mut config = EngineConfig::default();
        config.workers.initial_workers = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InitialWorkers { initial: 500, .. })
        ));
    }

    #[test]
    fn test_backoff_below_one_rejected() {
        let mut config = EngineConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "backoff_multiplier", .. })
        ));
    }

    #[test]
    fn test_infinite_backoff_rejected() {
        let mut config = EngineConfig::default();
        config.retry.backoff_multiplier = f64::INFINITY;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "backoff_multiplier", .. })
        ));
    }

    #[test]
    fn test_many_retries_accepted() {
        let mut config = EngineConfig::default();
        config.retry.max_retries = 100;
        assert_eq!(config.validate(), Ok(()));

        config.retry.max_delay = Duration::from_millis(10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "retry.max_delay", .. })
        ));
    }

    #[test]
    fn test_resource_limits_are_percentages() {
        let mut config = EngineConfig::default();
        config.scaling.resource_limits.scale_down_cpu_percent = 120.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "scaling.resource_limits",
                ..
            })
        ));

        config.scaling.resource_limits.scale_down_cpu_percent = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_domain_allow_list() {
        let policy = ResourcePolicy::default().allow_domain("help.autodesk.com");
        assert!(policy.allows_navigation("https://help.autodesk.com/view/OARX/2025/ENU/"));
        assert!(policy.allows_navigation("https://cdn.help.autodesk.com/x.js"));
        assert!(!policy.allows_navigation("https://evilhelp.autodesk.com.example.org/"));
        assert!(!policy.allows_navigation("not a url"));
        assert!(ResourcePolicy::default().allows_navigation("https://anything.example"));
    }

    #[test]
    fn test_request_filtering() {
        let policy = ResourcePolicy::default().allow_domain("docs.example.com");
        assert!(policy.allows_request("https://docs.example.com/app.js", ResourceType::Script));
        assert!(!policy.allows_request("https://docs.example.com/logo.png", ResourceType::Image));
        assert!(!policy.allows_request(
            "https://docs.example.com/site.css",
            ResourceType::Stylesheet
        ));
        assert!(policy.allows_request("https://docs.example.com/api", ResourceType::Xhr));
        assert!(ResourcePolicy::permissive()
            .allows_request("https://x.org/a.png", ResourceType::Image));
    }

    #[test]
    fn test_requests_outside_allow_list_are_blocked() {
        let policy = ResourcePolicy::default().allow_domain("docs.example.com");
        assert!(!policy.allows_request("https://evil.org/", ResourceType::Document));
        assert!(!policy.allows_request("https://evil.org/x.js", ResourceType::Script));
        assert!(!policy.allows_request("https://evil.org/api", ResourceType::Xhr));
        assert!(policy.allows_request("https://cdn.docs.example.com/x.js", ResourceType::Script));
    }
}
