//! A simulated documentation site for local runs.
//!
//! Every node above the configured depth has `fanout` children. Page
//! operations take a jittered latency and fail transiently at the configured
//! rate, which is enough to exercise retries, the pool and scaling without a
//! real browser.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use url::Url;

use treecrawl_core::task::PATH_SEPARATOR;
use treecrawl_core::{NodeInfo, TaskError};
use treecrawl_engine::config::ResourcePolicy;
use treecrawl_engine::{BrowserDriver, BrowserPage, Discovery, ElementInfo, PageLease};

const ROOT_SELECTOR: &str = "[role=tree] > [role=treeitem]";

fn children_selector(path: &str) -> String {
    format!("[data-path=\"{path}\"] > [role=group] > [role=treeitem]")
}

fn toggle_selector(path: &str) -> String {
    format!("[data-path=\"{path}\"] > .toggle")
}

fn selector_path(selector: &str) -> Option<&str> {
    selector
        .strip_prefix("[data-path=\"")?
        .split_once("\"]")
        .map(|(path, _)| path)
}

/// Shape and behaviour of the simulated site.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub base_url: Url,
    pub roots: usize,
    /// Number of tree levels, roots included.
    pub depth: u32,
    pub fanout: usize,
    /// Probability in `[0, 1]` that a page operation fails transiently.
    pub failure_rate: f64,
    /// Mean latency of a page operation.
    pub latency: Duration,
    pub seed: u64,
}

impl SiteConfig {
    fn root_labels(&self) -> Vec<String> {
        (1..=self.roots).map(|n| format!("Guide {n}")).collect()
    }

    fn child_labels(&self, path: &str) -> Vec<String> {
        let level = path.split(PATH_SEPARATOR).count() as u32;
        if level >= self.depth {
            return Vec::new();
        }
        (1..=self.fanout).map(|n| format!("Section {n}")).collect()
    }

    fn href(&self, path: &str) -> Option<String> {
        let slug: Vec<String> = path
            .split(PATH_SEPARATOR)
            .map(|label| label.to_lowercase().replace(' ', "-"))
            .collect();
        self.base_url.join(&slug.join("/")).ok().map(String::from)
    }

    fn element(&self, path: &str, label: &str) -> ElementInfo {
        ElementInfo {
            text: label.to_string(),
            data_id: Some(path.to_string()),
            href: self.href(path),
            expandable: !self.child_labels(path).is_empty(),
        }
    }

    /// Total number of nodes in the simulated tree.
    pub fn node_count(&self) -> usize {
        let mut level = self.roots;
        let mut total = 0;
        for _ in 0..self.depth {
            total += level;
            level *= self.fanout;
        }
        total
    }
}

/// Driver handing out simulated pages.
#[derive(Debug)]
pub struct SimulatedDriver {
    site: Arc<SiteConfig>,
    pages: AtomicU64,
}

#[async_trait]
impl BrowserDriver for SimulatedDriver {
    async fn open_page(
        &self,
        _policy: &ResourcePolicy,
    ) -> Result<Box<dyn BrowserPage>, TaskError> {
        let n = self.pages.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimulatedPage {
            site: self.site.clone(),
            rng: StdRng::seed_from_u64(self.site.seed.wrapping_add(n)),
        }))
    }
}

struct SimulatedPage {
    site: Arc<SiteConfig>,
    rng: StdRng,
}

impl SimulatedPage {
    async fn round_trip(&mut self, operation: &str) -> Result<(), TaskError> {
        let latency = self.site.latency;
        if !latency.is_zero() {
            let jitter: f64 = self.rng.gen_range(0.5..1.5);
            tokio::time::sleep(latency.mul_f64(jitter)).await;
        }
        if self.rng.gen_bool(self.site.failure_rate) {
            return Err(TaskError::TransientIo(format!("{operation}: connection reset")));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for SimulatedPage {
    async fn navigate(&mut self, _url: &str) -> Result<(), TaskError> {
        self.round_trip("navigate").await
    }

    async fn query(&mut self, selector: &str) -> Result<Vec<ElementInfo>, TaskError> {
        self.round_trip("query").await?;
        if selector == ROOT_SELECTOR {
            return Ok(self
                .site
                .root_labels()
                .iter()
                .map(|label| self.site.element(label, label))
                .collect());
        }
        let path = selector_path(selector)
            .ok_or_else(|| TaskError::Structural(format!("unsupported selector {selector}")))?;
        Ok(self
            .site
            .child_labels(path)
            .iter()
            .map(|label| {
                let child = format!("{path}{PATH_SEPARATOR}{label}");
                self.site.element(&child, label)
            })
            .collect())
    }

    async fn expand(&mut self, selector: &str) -> Result<(), TaskError> {
        if selector_path(selector).is_none() {
            return Err(TaskError::Structural(format!("no element matches {selector}")));
        }
        self.round_trip("expand").await
    }

    async fn close(self: Box<Self>) {}
}

/// Turns simulated tree items into nodes.
#[derive(Debug)]
pub struct SimulatedDiscovery {
    site: Arc<SiteConfig>,
}

fn node_from(element: ElementInfo, node: NodeInfo) -> NodeInfo {
    let mut node = NodeInfo {
        is_leaf: !element.expandable,
        ..node
    };
    if let Some(href) = element.href {
        node = node.with_url(href);
    }
    if let Some(id) = element.data_id {
        node = node.with_guid(id);
    }
    node
}

#[async_trait]
impl Discovery for SimulatedDiscovery {
    async fn discover_roots(&self, page: &mut PageLease) -> Result<Vec<NodeInfo>, TaskError> {
        page.navigate(self.site.base_url.as_str()).await?;
        let items = page.query(ROOT_SELECTOR).await?;
        Ok(items
            .into_iter()
            .map(|element| {
                let root = NodeInfo::root(element.text.as_str());
                node_from(element, root)
            })
            .collect())
    }

    async fn expand(
        &self,
        page: &mut PageLease,
        node: &NodeInfo,
    ) -> Result<Vec<NodeInfo>, TaskError> {
        if node.is_leaf {
            return Ok(Vec::new());
        }
        if let Some(url) = &node.url {
            page.navigate(url).await?;
        }
        page.expand(&toggle_selector(&node.path)).await?;
        let items = page.query(&children_selector(&node.path)).await?;
        Ok(items
            .into_iter()
            .map(|element| {
                let child = node.child(element.text.as_str());
                node_from(element, child)
            })
            .collect())
    }
}

/// Build the driver and discovery for `site`.
pub fn simulate(site: SiteConfig) -> (Arc<SimulatedDriver>, Arc<SimulatedDiscovery>) {
    let site = Arc::new(site);
    (
        Arc::new(SimulatedDriver {
            site: site.clone(),
            pages: AtomicU64::new(0),
        }),
        Arc::new(SimulatedDiscovery { site }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use treecrawl_engine::{CrawlOutcome, EngineConfig, EngineError, Orchestrator};

    fn site(failure_rate: f64) -> SiteConfig {
        SiteConfig {
            base_url: Url::parse("https://docs.example.com/").unwrap(),
            roots: 2,
            depth: 3,
            fanout: 2,
            failure_rate,
            latency: Duration::from_millis(20),
            seed: 7,
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.workers.min_workers = 1;
        config.workers.initial_workers = 3;
        config.workers.max_workers = 6;
        config.workers.dequeue_timeout = Duration::from_millis(200);
        config.pool.size = 3;
        config.scaling.resource_limits.enabled = false;
        config.pool.resource_policy = ResourcePolicy::default().allow_domain("docs.example.com");
        config
    }

    #[test]
    fn test_tree_shape() {
        let site = site(0.0);
        assert_eq!(site.node_count(), 2 + 4 + 8);
        assert_eq!(site.child_labels("Guide 1").len(), 2);
        assert!(site
            .child_labels("Guide 1 > Section 1 > Section 2")
            .is_empty());
        assert_eq!(
            site.href("Guide 1 > Section 2").as_deref(),
            Some("https://docs.example.com/guide-1/section-2")
        );
    }

    #[test]
    fn test_selector_path() {
        assert_eq!(
            selector_path(&children_selector("Guide 1 > Section 1")),
            Some("Guide 1 > Section 1")
        );
        assert_eq!(selector_path(ROOT_SELECTOR), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crawls_whole_tree() {
        let site = site(0.0);
        let expected = site.node_count();
        let (driver, discovery) = simulate(site);
        let report = Orchestrator::new(config(), driver, discovery)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, CrawlOutcome::Completed);
        assert_eq!(report.completed.len(), expected);
        assert_eq!(report.statistics.hierarchy.max_depth, 2);
        let leaf = report
            .completed
            .values()
            .find(|node| node.path == "Guide 2 > Section 1 > Section 1")
            .unwrap();
        assert!(leaf.is_leaf);
        assert_eq!(
            leaf.url.as_deref(),
            Some("https://docs.example.com/guide-2/section-1/section-1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_site_is_fatal() {
        let (driver, discovery) = simulate(site(1.0));
        let err = Orchestrator::new(config(), driver, discovery)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Discovery(TaskError::TransientIo(_))));
    }
}
