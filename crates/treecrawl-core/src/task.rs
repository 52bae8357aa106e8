//! Task and tree node types.

use crate::{FailureClass, TaskError, TaskId, TaskStatus, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between labels in a node's hierarchical path.
pub const PATH_SEPARATOR: &str = " > ";

/// A node of the documentation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Label shown in the tree.
    pub label: String,

    /// Labels from the root down to this node, joined by `" > "`.
    pub path: String,

    /// Distance from the root level (roots are depth 0).
    pub depth: u32,

    /// Whether the node has no children.
    pub is_leaf: bool,

    /// Worker that expanded this node.
    pub worker_id: Option<WorkerId>,

    /// Labels of the children discovered when the node was expanded.
    pub children: Vec<String>,

    /// Page the node points at, if the tree exposes one.
    pub url: Option<String>,

    /// Stable node identifier from the page (`data-id`), if any.
    pub guid: Option<String>,
}

impl NodeInfo {
    /// Create a root-level node.
    pub fn root(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            path: label.clone(),
            label,
            depth: 0,
            is_leaf: false,
            worker_id: None,
            children: Vec::new(),
            url: None,
            guid: None,
        }
    }

    /// Create a node one level below `self`.
    pub fn child(&self, label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            path: format!("{}{}{}", self.path, PATH_SEPARATOR, label),
            label,
            depth: self.depth + 1,
            is_leaf: false,
            worker_id: None,
            children: Vec::new(),
            url: None,
            guid: None,
        }
    }

    /// Builder method to set the url.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Builder method to set the guid.
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }
}

/// A Task is one unit of crawl work: expanding a single tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Task that discovered this node, `None` for roots.
    pub parent_id: Option<TaskId>,

    /// The node to expand.
    pub node: NodeInfo,

    /// Scheduling priority, lower runs first. Equals the node depth.
    pub priority: u32,

    /// Attempts already retried.
    pub retry_count: u32,

    /// Current task status.
    pub status: TaskStatus,

    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a root task for a node returned by discovery.
    pub fn root(node: NodeInfo) -> Self {
        Self {
            id: TaskId::generate(),
            parent_id: None,
            priority: node.depth,
            node,
            retry_count: 0,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Create a task for a node discovered while running `self`.
    pub fn child(&self, node: NodeInfo) -> Self {
        Self {
            id: TaskId::generate(),
            parent_id: Some(self.id.clone()),
            priority: node.depth,
            node,
            retry_count: 0,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Returns true for tasks created by root discovery.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Summary of a permanently failed task, kept for the final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Rendered error message.
    pub error: String,

    /// Classification of the last error.
    pub class: FailureClass,

    /// Retries spent before giving up.
    pub retry_count: u32,

    /// Path of the node that failed.
    pub path: String,

    /// When the task was given up.
    pub failed_at: DateTime<Utc>,
}

impl TaskFailure {
    /// Build the failure summary for `task` failing with `error`.
    pub fn new(task: &Task, error: &TaskError) -> Self {
        Self {
            error: error.to_string(),
            class: error.class(),
            retry_count: task.retry_count,
            path: task.node.path.clone(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_node_path_and_depth() {
        let root = NodeInfo::root("ObjectARX");
        let child = root.child("Reference").child("Classes");
        assert_eq!(child.path, "ObjectARX > Reference > Classes");
        assert_eq!(child.depth, 2);
        assert_eq!(child.label, "Classes");
    }

    #[test]
    fn test_child_task_links_parent() {
        let root = Task::root(NodeInfo::root("Guide"));
        let child = root.child(root.node.child("Install"));
        assert!(root.is_root());
        assert_eq!(child.parent_id.as_ref(), Some(&root.id));
        assert_eq!(child.priority, 1);
        assert_eq!(child.status, TaskStatus::Pending);
    }

    #[test]
    fn test_failure_summary() {
        let mut task = Task::root(NodeInfo::root("Guide"));
        task.retry_count = 3;
        let failure = TaskFailure::new(&task, &TaskError::TransientIo("reset".into()));
        assert_eq!(failure.retry_count, 3);
        assert_eq!(failure.class, FailureClass::TransientIo);
        assert_eq!(failure.path, "Guide");
    }
}
