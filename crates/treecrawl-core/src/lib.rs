//! treecrawl Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - An async runtime
//! - Browser automation
//! - Output formats
//!
//! All types here describe the crawl domain: tasks, tree nodes, their
//! statuses, failure classification and observability events.

pub mod error;
pub mod event;
pub mod ids;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::{FailureClass, TaskError};
pub use event::{CrawlEvent, EventCategory, EventKind, ScalingAction};
pub use ids::{TaskId, WorkerId};
pub use status::{CircuitState, PoolHealth, TaskStatus, WorkerState};
pub use task::{NodeInfo, Task, TaskFailure};
