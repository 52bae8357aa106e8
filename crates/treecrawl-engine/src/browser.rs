//! Collaborator capabilities the engine depends on.
//!
//! The engine never talks to a browser or parses a page itself. A
//! [`BrowserDriver`] opens pages, and a [`Discovery`] implementation turns a
//! page into tree nodes.

use async_trait::async_trait;

use treecrawl_core::{NodeInfo, TaskError};

use crate::config::ResourcePolicy;
use crate::pool::PageLease;

/// An element returned by a DOM query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementInfo {
    /// Visible text content.
    pub text: String,
    /// Stable identifier (`data-id`), if present.
    pub data_id: Option<String>,
    /// Link target, if the element is an anchor.
    pub href: Option<String>,
    /// Whether the element can be expanded.
    pub expandable: bool,
}

/// One open browser page.
#[async_trait]
pub trait BrowserPage: Send {
    /// Load `url` in this page.
    async fn navigate(&mut self, url: &str) -> Result<(), TaskError>;

    /// Return the elements matching a CSS selector.
    async fn query(&mut self, selector: &str) -> Result<Vec<ElementInfo>, TaskError>;

    /// Click/expand the element matching `selector`.
    async fn expand(&mut self, selector: &str) -> Result<(), TaskError>;

    /// Release the page's browser resources.
    async fn close(self: Box<Self>);
}

/// Opens pages. `policy` must be applied to every page it returns.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_page(&self, policy: &ResourcePolicy) -> Result<Box<dyn BrowserPage>, TaskError>;
}

/// Finds tree nodes on a page.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Locate the root-level nodes of the tree.
    async fn discover_roots(&self, page: &mut PageLease) -> Result<Vec<NodeInfo>, TaskError>;

    /// Expand `node` and return its direct children.
    ///
    /// Returned nodes should already carry the right path and depth
    /// (use [`NodeInfo::child`]).
    async fn expand(&self, page: &mut PageLease, node: &NodeInfo)
        -> Result<Vec<NodeInfo>, TaskError>;
}
