//! Bounded pool of reusable browser pages.
//!
//! At most `size` pages are alive at any time (idle plus checked out). A
//! worker obtains a [`PageLease`] with [`BrowserPool::acquire`] and hands it
//! back with [`BrowserPool::release`]. Reuse is suspended while the circuit
//! breaker is open: every acquisition then gets a freshly opened page.

mod circuit;

pub use circuit::CircuitBreaker;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use treecrawl_core::{CircuitState, PoolHealth, TaskError};

use crate::browser::{BrowserDriver, BrowserPage, ElementInfo};
use crate::config::PoolConfig;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub live: usize,
    pub checked_out: usize,
    pub idle: usize,
    pub circuit: CircuitState,
    pub health: PoolHealth,
    pub created: u64,
    pub reused: u64,
    pub closed: u64,
    pub exhausted: u64,
    pub circuit_trips: u64,
}

struct PoolEntry {
    id: u64,
    page: Box<dyn BrowserPage>,
    usage_count: u32,
    consecutive_failures: u32,
    health: PoolHealth,
}

#[derive(Default)]
struct PoolStats {
    created: u64,
    reused: u64,
    closed: u64,
    exhausted: u64,
}

struct PoolState {
    idle: Vec<PoolEntry>,
    live: usize,
    next_entry_id: u64,
    breaker: CircuitBreaker,
    stats: PoolStats,
}

struct PoolShared {
    driver: Arc<dyn BrowserDriver>,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolShared {
    /// Forget an entry without returning it to the idle list.
    fn discard(&self, entry: PoolEntry) -> Box<dyn BrowserPage> {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        state.stats.closed += 1;
        entry.page
    }
}

/// Counts a page that is being opened as live. Dropping the guard before
/// [`finish`](Self::finish) (failed open, cancelled acquire) gives the count
/// back.
struct OpeningPage<'a> {
    state: &'a Mutex<PoolState>,
    armed: bool,
}

impl<'a> OpeningPage<'a> {
    fn start(state: &'a Mutex<PoolState>) -> Self {
        state.lock().live += 1;
        Self { state, armed: true }
    }

    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for OpeningPage<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            state.live = state.live.saturating_sub(1);
        }
    }
}

/// Shared handle to the browser pool. Cheap to clone.
#[derive(Clone)]
pub struct BrowserPool {
    shared: Arc<PoolShared>,
}

impl BrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: PoolConfig) -> Self {
        let breaker = CircuitBreaker::new(&config.circuit);
        Self {
            shared: Arc::new(PoolShared {
                driver,
                slots: Arc::new(Semaphore::new(config.size)),
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(config.size),
                    live: 0,
                    next_entry_id: 1,
                    breaker,
                    stats: PoolStats::default(),
                }),
                config,
            }),
        }
    }

    /// Obtain a page, waiting up to `acquire_timeout` for a free slot.
    ///
    /// Fails with [`TaskError::ResourceExhaustion`] when no slot frees up in
    /// time, when the pool is closed, or when a fresh page cannot be opened.
    pub async fn acquire(&self) -> Result<PageLease, TaskError> {
        let wait = self.shared.config.acquire_timeout;
        let permit =
            match tokio::time::timeout(wait, self.shared.slots.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(TaskError::ResourceExhaustion(
                        "browser pool is closed".to_string(),
                    ))
                }
                Err(_) => {
                    self.shared.state.lock().stats.exhausted += 1;
                    warn!(timeout = ?wait, "Browser pool exhausted");
                    return Err(TaskError::ResourceExhaustion(format!(
                        "no browser page available within {wait:?}"
                    )));
                }
            };

        let (reused, stale) = {
            let mut state = self.shared.state.lock();
            if state.breaker.is_open() {
                // Idle pages are not trusted while the breaker is open.
                let stale: Vec<PoolEntry> = state.idle.drain(..).collect();
                state.live -= stale.len();
                state.stats.closed += stale.len() as u64;
                (None, stale)
            } else {
                let reused = state.idle.pop().map(|mut entry| {
                    entry.usage_count += 1;
                    entry
                });
                if reused.is_some() {
                    state.stats.reused += 1;
                }
                (reused, Vec::new())
            }
        };
        for entry in stale {
            entry.page.close().await;
        }

        if let Some(entry) = reused {
            debug!(entry = entry.id, uses = entry.usage_count, "Reusing browser page");
            return Ok(self.lease(entry, permit, false));
        }

        let opening = OpeningPage::start(&self.shared.state);
        match self
            .shared
            .driver
            .open_page(&self.shared.config.resource_policy)
            .await
        {
            Ok(page) => {
                opening.finish();
                let id = {
                    let mut state = self.shared.state.lock();
                    state.stats.created += 1;
                    state.breaker.record_fresh_success();
                    let id = state.next_entry_id;
                    state.next_entry_id += 1;
                    id
                };
                debug!(entry = id, "Opened browser page");
                let entry = PoolEntry {
                    id,
                    page,
                    usage_count: 1,
                    consecutive_failures: 0,
                    health: PoolHealth::Healthy,
                };
                Ok(self.lease(entry, permit, true))
            }
            Err(e) => {
                drop(opening);
                self.shared.state.lock().breaker.record_failure();
                warn!(error = %e, "Failed to open browser page");
                Err(TaskError::ResourceExhaustion(format!(
                    "failed to open browser page: {e}"
                )))
            }
        }
    }

    fn lease(&self, entry: PoolEntry, permit: OwnedSemaphorePermit, fresh: bool) -> PageLease {
        PageLease {
            entry: Some(entry),
            _permit: permit,
            shared: self.shared.clone(),
            fresh,
        }
    }

    /// Return a lease. `success` reports whether the task using it succeeded.
    ///
    /// Failed, worn-out and (while the breaker is open) all pages are closed
    /// instead of going back to the idle list.
    pub async fn release(&self, mut lease: PageLease, success: bool) {
        let Some(mut entry) = lease.entry.take() else {
            return;
        };
        let max_uses = self.shared.config.max_uses_per_entry;

        let to_close = {
            let mut state = self.shared.state.lock();
            if success {
                entry.consecutive_failures = 0;
                state.breaker.record_success();
            } else {
                entry.consecutive_failures += 1;
                entry.health = PoolHealth::Degraded;
                state.breaker.record_failure();
            }

            let keep = entry.health == PoolHealth::Healthy
                && entry.usage_count < max_uses
                && !state.breaker.is_open();
            if keep {
                state.idle.push(entry);
                None
            } else {
                state.live -= 1;
                state.stats.closed += 1;
                Some(entry)
            }
        };
        // The permit is returned only after the entry is back on the idle list.
        drop(lease);

        if let Some(entry) = to_close {
            debug!(
                entry = entry.id,
                uses = entry.usage_count,
                failures = entry.consecutive_failures,
                "Closing browser page"
            );
            entry.page.close().await;
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.shared.state.lock().breaker.state()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        let idle = state.idle.len();
        let circuit = state.breaker.state();
        PoolStatus {
            size: self.shared.config.size,
            live: state.live,
            checked_out: state.live.saturating_sub(idle),
            idle,
            circuit,
            health: match circuit {
                CircuitState::Closed => PoolHealth::Healthy,
                CircuitState::Open => PoolHealth::Degraded,
            },
            created: state.stats.created,
            reused: state.stats.reused,
            closed: state.stats.closed,
            exhausted: state.stats.exhausted,
            circuit_trips: state.breaker.trips(),
        }
    }

    /// Close every idle page and refuse further acquisitions. Leases still
    /// out are closed when they are released or dropped.
    pub async fn close_all(&self) {
        self.shared.slots.close();
        let idle: Vec<PoolEntry> = {
            let mut state = self.shared.state.lock();
            let idle: Vec<PoolEntry> = state.idle.drain(..).collect();
            state.live -= idle.len();
            state.stats.closed += idle.len() as u64;
            idle
        };
        let count = idle.len();
        for entry in idle {
            entry.page.close().await;
        }
        info!(closed = count, "Browser pool closed");
    }
}

impl fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserPool")
            .field("status", &self.status())
            .finish()
    }
}

/// Exclusive use of one pooled page.
///
/// Every page operation is bounded by the pool's timeouts and navigation is
/// restricted by the resource policy. A lease dropped without
/// [`BrowserPool::release`] closes its page.
pub struct PageLease {
    entry: Option<PoolEntry>,
    _permit: OwnedSemaphorePermit,
    shared: Arc<PoolShared>,
    fresh: bool,
}

impl PageLease {
    /// Identifier of the underlying pool entry.
    pub fn entry_id(&self) -> u64 {
        self.entry.as_ref().map_or(0, |e| e.id)
    }

    /// Number of tasks this page has served, this one included.
    pub fn usage_count(&self) -> u32 {
        self.entry.as_ref().map_or(0, |e| e.usage_count)
    }

    /// Whether the page was opened for this lease rather than reused.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    fn page(&mut self) -> Result<&mut Box<dyn BrowserPage>, TaskError> {
        self.entry
            .as_mut()
            .map(|e| &mut e.page)
            .ok_or_else(|| TaskError::ResourceExhaustion("page lease already released".into()))
    }

    pub async fn navigate(&mut self, url: &str) -> Result<(), TaskError> {
        if !self.shared.config.resource_policy.allows_navigation(url) {
            return Err(TaskError::Structural(format!(
                "navigation to {url} is outside the allowed domains"
            )));
        }
        let limit = self.shared.config.page_load_timeout;
        let page = self.page()?;
        tokio::time::timeout(limit, page.navigate(url))
            .await
            .map_err(|_| TaskError::timeout("navigation", limit))?
    }

    pub async fn query(&mut self, selector: &str) -> Result<Vec<ElementInfo>, TaskError> {
        let limit = self.shared.config.dom_operation_timeout;
        let page = self.page()?;
        tokio::time::timeout(limit, page.query(selector))
            .await
            .map_err(|_| TaskError::timeout("query", limit))?
    }

    pub async fn expand(&mut self, selector: &str) -> Result<(), TaskError> {
        let limit = self.shared.config.dom_operation_timeout;
        let page = self.page()?;
        tokio::time::timeout(limit, page.expand(selector))
            .await
            .map_err(|_| TaskError::timeout("expand", limit))?
    }
}

impl fmt::Debug for PageLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLease")
            .field("entry", &self.entry_id())
            .field("usage_count", &self.usage_count())
            .field("fresh", &self.fresh)
            .finish()
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        warn!(entry = entry.id, "Page lease dropped without release, closing page");
        let page = self.shared.discard(entry);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(page.close());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{CircuitBreakerConfig, ResourcePolicy};
    use crate::test_support::ScriptedDriver;

    fn config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            acquire_timeout: Duration::from_millis(100),
            max_uses_per_entry: 3,
            page_load_timeout: Duration::from_secs(1),
            dom_operation_timeout: Duration::from_secs(1),
            circuit: CircuitBreakerConfig {
                failure_threshold: 2,
                window: Duration::from_secs(60),
                recovery_successes: 2,
            },
            resource_policy: ResourcePolicy::default().allow_domain("docs.example.com"),
        }
    }

    #[tokio::test]
    async fn test_reuses_released_page() {
        let driver = ScriptedDriver::new();
        let pool = BrowserPool::new(driver.clone(), config(2));

        let lease = pool.acquire().await.unwrap();
        let first = lease.entry_id();
        assert!(lease.is_fresh());
        pool.release(lease, true).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.entry_id(), first);
        assert!(!lease.is_fresh());
        assert_eq!(lease.usage_count(), 2);
        pool.release(lease, true).await;

        assert_eq!(driver.opened(), 1);
        let status = pool.status();
        assert_eq!(status.live, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.reused, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_timeout() {
        let pool = BrowserPool::new(ScriptedDriver::new(), config(1));
        let held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, TaskError::ResourceExhaustion(_)));
        assert_eq!(pool.status().exhausted, 1);
        assert!(pool.status().live <= 1);

        pool.release(held, true).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_worn_out_page_is_closed() {
        let driver = ScriptedDriver::new();
        let pool = BrowserPool::new(driver.clone(), config(1));

        for _ in 0..3 {
            let lease = pool.acquire().await.unwrap();
            pool.release(lease, true).await;
        }
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.status().idle, 0);

        let lease = pool.acquire().await.unwrap();
        assert!(lease.is_fresh());
        pool.release(lease, true).await;
        assert_eq!(driver.opened(), 2);
    }

    #[tokio::test]
    async fn test_failure_degrades_entry_and_trips_breaker() {
        let driver = ScriptedDriver::new();
        let pool = BrowserPool::new(driver.clone(), config(2));

        let lease = pool.acquire().await.unwrap();
        pool.release(lease, false).await;
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.circuit_state(), CircuitState::Closed);

        let lease = pool.acquire().await.unwrap();
        pool.release(lease, false).await;
        assert_eq!(pool.circuit_state(), CircuitState::Open);
        assert_eq!(pool.status().health, PoolHealth::Degraded);

        // While open, healthy pages are not kept either.
        let lease = pool.acquire().await.unwrap();
        assert!(lease.is_fresh());
        pool.release(lease, true).await;
        assert_eq!(pool.status().idle, 0);

        // Second fresh success closes the breaker.
        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.circuit_state(), CircuitState::Closed);
        pool.release(lease, true).await;
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().circuit_trips, 1);
    }

    #[tokio::test]
    async fn test_failed_open_is_exhaustion() {
        let driver = ScriptedDriver::new().with_failing_opens(1);
        let pool = BrowserPool::new(driver.clone(), config(1));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, TaskError::ResourceExhaustion(_)));
        assert_eq!(pool.status().live, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_is_bounded() {
        let driver = ScriptedDriver::new().with_navigate_delay(Duration::from_secs(5));
        let pool = BrowserPool::new(driver, config(1));
        let mut lease = pool.acquire().await.unwrap();

        let err = lease
            .navigate("https://docs.example.com/guide")
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::TransientIo(_)));

        let err = lease.navigate("https://elsewhere.org/").await.unwrap_err();
        assert!(matches!(err, TaskError::Structural(_)));
        pool.release(lease, false).await;
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_slot() {
        let driver = ScriptedDriver::new();
        let pool = BrowserPool::new(driver.clone(), config(1));
        let lease = pool.acquire().await.unwrap();
        drop(lease);

        assert_eq!(pool.status().live, 0);
        let lease = pool.acquire().await.unwrap();
        assert!(lease.is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_open_does_not_leak_live_count() {
        let driver = ScriptedDriver::new().with_open_delay(Duration::from_secs(60));
        let pool = BrowserPool::new(driver.clone(), config(2));

        let attempt = tokio::time::timeout(Duration::from_secs(1), pool.acquire()).await;
        assert!(attempt.is_err());

        let status = pool.status();
        assert_eq!(status.live, 0);
        assert_eq!(status.checked_out, 0);
        assert_eq!(driver.opened(), 0);

        // The slot is usable again.
        let lease = tokio::time::timeout(Duration::from_secs(120), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.status().checked_out, 1);
        pool.release(lease, true).await;
        assert_eq!(pool.status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_close_all_rejects_acquire() {
        let driver = ScriptedDriver::new();
        let pool = BrowserPool::new(driver.clone(), config(2));
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, true).await;

        pool.close_all().await;
        assert_eq!(driver.closed(), 1);
        assert_eq!(pool.status().live, 0);
        assert!(pool.acquire().await.is_err());
    }
}
