//! In-memory browser and discovery doubles shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use treecrawl_core::{NodeInfo, TaskError};

use crate::browser::{BrowserDriver, BrowserPage, Discovery, ElementInfo};
use crate::config::ResourcePolicy;
use crate::pool::PageLease;

/// Driver whose pages always succeed, optionally after a delay.
#[derive(Default)]
pub(crate) struct ScriptedDriver {
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    failing_opens: AtomicUsize,
    navigate_delay: Duration,
    open_delay: Duration,
}

impl ScriptedDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_failing_opens(self: Arc<Self>, count: usize) -> Arc<Self> {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_navigate_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        let mut driver = Arc::try_unwrap(self).unwrap_or_default();
        driver.navigate_delay = delay;
        Arc::new(driver)
    }

    pub(crate) fn with_open_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        let mut driver = Arc::try_unwrap(self).unwrap_or_default();
        driver.open_delay = delay;
        Arc::new(driver)
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn open_page(&self, _policy: &ResourcePolicy) -> Result<Box<dyn BrowserPage>, TaskError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(TaskError::TransientIo("browser crashed".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPage {
            closed: self.closed.clone(),
            navigate_delay: self.navigate_delay,
        }))
    }
}

struct ScriptedPage {
    closed: Arc<AtomicUsize>,
    navigate_delay: Duration,
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn navigate(&mut self, _url: &str) -> Result<(), TaskError> {
        if !self.navigate_delay.is_zero() {
            tokio::time::sleep(self.navigate_delay).await;
        }
        Ok(())
    }

    async fn query(&mut self, _selector: &str) -> Result<Vec<ElementInfo>, TaskError> {
        Ok(Vec::new())
    }

    async fn expand(&mut self, _selector: &str) -> Result<(), TaskError> {
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Discovery over a fixed tree keyed by node path, with scripted failures.
#[derive(Default)]
pub(crate) struct FakeTree {
    roots: Vec<String>,
    children: HashMap<String, Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<TaskError>>>,
    root_failures: Mutex<VecDeque<TaskError>>,
    panics: HashSet<String>,
    delay: Duration,
}

impl FakeTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `roots` roots, each with `fanout` leaf children.
    pub(crate) fn uniform(roots: usize, fanout: usize) -> Self {
        let mut tree = Self::new();
        for r in 0..roots {
            let root = format!("R{r}");
            tree = tree.root(&root);
            for c in 0..fanout {
                tree = tree.child(&root, &format!("C{c}"));
            }
        }
        tree
    }

    pub(crate) fn root(mut self, label: &str) -> Self {
        self.roots.push(label.to_string());
        self
    }

    /// Add `label` under the node at `parent_path`.
    pub(crate) fn child(mut self, parent_path: &str, label: &str) -> Self {
        self.children
            .entry(parent_path.to_string())
            .or_default()
            .push(label.to_string());
        self
    }

    /// Expanding the node at `path` fails with `error` the next `times` times.
    pub(crate) fn fail(self, path: &str, error: TaskError, times: usize) -> Self {
        self.failures
            .lock()
            .entry(path.to_string())
            .or_default()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    pub(crate) fn fail_roots(self, error: TaskError, times: usize) -> Self {
        self.root_failures
            .lock()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    /// Expanding the node at `path` panics.
    pub(crate) fn panic_on(mut self, path: &str) -> Self {
        self.panics.insert(path.to_string());
        self
    }

    /// Every expansion takes this long.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Discovery for FakeTree {
    async fn discover_roots(&self, page: &mut PageLease) -> Result<Vec<NodeInfo>, TaskError> {
        if let Some(error) = self.root_failures.lock().pop_front() {
            return Err(error);
        }
        page.query("[role=treeitem]").await?;
        Ok(self.roots.iter().map(|label| NodeInfo::root(label.as_str())).collect())
    }

    async fn expand(
        &self,
        page: &mut PageLease,
        node: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, TaskError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics.contains(&node.path) {
            panic!("expansion of {} crashed", node.path);
        }
        let scripted = self
            .failures
            .lock()
            .get_mut(&node.path)
            .and_then(|queue| queue.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }
        page.expand(&format!("[data-path=\"{}\"]", node.path)).await?;
        Ok(self
            .children
            .get(&node.path)
            .map(|labels| labels.iter().map(|label| node.child(label.as_str())).collect())
            .unwrap_or_default())
    }
}
