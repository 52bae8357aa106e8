//! treecrawl Engine
//!
//! This crate runs a crawl: a pool of async workers expands documentation
//! tree nodes on pooled browser pages, an adaptive scaling engine resizes the
//! worker set, and a hierarchical tracker records the parent/child structure
//! of every task for reporting.

pub mod browser;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pool;
pub mod resources;
pub mod retry;
pub mod scaling;
pub mod telemetry;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use browser::{BrowserDriver, BrowserPage, Discovery, ElementInfo};
pub use config::{ConfigError, EngineConfig};
pub use context::{ContextSnapshot, CrawlResults, WorkerContext};
pub use error::{EngineError, TrackerError};
pub use events::{spawn_subscriber, EventBus, EventSubscriber, LogSubscriber};
pub use orchestrator::{CrawlOutcome, CrawlReport, Orchestrator};
pub use pool::{BrowserPool, PageLease, PoolStatus};
pub use resources::{ResourceMonitor, ResourceSample, SystemMonitor};
pub use tracker::{TaskHierarchy, Tracker, TrackingStatistics};
