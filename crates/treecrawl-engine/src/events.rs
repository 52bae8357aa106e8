//! Observability event bus.
//!
//! Events are published on a bounded broadcast channel. Categories disabled in
//! [`ObservabilityConfig`] are dropped at the source; a subscriber that falls
//! behind loses the oldest events instead of slowing the crawl down.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use treecrawl_core::{CrawlEvent, EventKind};

use crate::config::ObservabilityConfig;

/// Publisher side of the event stream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CrawlEvent>,
    config: ObservabilityConfig,
}

impl EventBus {
    pub fn new(config: ObservabilityConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self { sender, config }
    }

    /// Publish an event if its category is enabled. Never blocks; having no
    /// subscribers is not an error.
    pub fn publish(&self, event: CrawlEvent) {
        if !self.config.is_enabled(event.category()) {
            return;
        }
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Gaps left by lagging are skipped silently.
    pub fn stream(&self) -> impl Stream<Item = CrawlEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| item.ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Consumer of crawl events.
#[async_trait]
pub trait EventSubscriber: Send + 'static {
    async fn on_event(&mut self, event: CrawlEvent);

    /// Called once `skipped` events were lost to lagging.
    async fn on_lagged(&mut self, skipped: u64) {
        warn!(skipped, "Event subscriber lagged, oldest events dropped");
    }
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Default)]
pub struct LogSubscriber;

#[async_trait]
impl EventSubscriber for LogSubscriber {
    async fn on_event(&mut self, event: CrawlEvent) {
        match event.kind {
            EventKind::TaskStarted {
                task_id,
                worker_id,
                path,
                depth,
                attempt,
            } => {
                debug!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    depth,
                    attempt,
                    path = %path,
                    "Task started"
                );
            }
            EventKind::TaskCompleted {
                task_id,
                worker_id,
                status,
                children,
                duration_ms,
            } => {
                debug!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    status = status.as_str(),
                    children,
                    duration_ms,
                    "Task finished"
                );
            }
            EventKind::ScalingDecision {
                action,
                current,
                target,
                reason,
            } => {
                info!(?action, current, target, reason = %reason, "Scaling decision");
            }
            EventKind::PoolStatus {
                size,
                checked_out,
                idle,
                circuit,
            } => {
                info!(size, checked_out, idle, ?circuit, "Browser pool status");
            }
        }
    }
}

/// Drive `subscriber` from `bus` until the bus closes or `cancel` fires.
pub fn spawn_subscriber<S>(
    bus: &EventBus,
    mut subscriber: S,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: EventSubscriber,
{
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => subscriber.on_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => subscriber.on_lagged(n).await,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use treecrawl_core::{CircuitState, EventCategory, ScalingAction, TaskId, WorkerId};

    use super::*;

    #[tokio::test]
    async fn test_disabled_categories_are_not_published() {
        let mut config = ObservabilityConfig::disabled();
        config.categories.insert(EventCategory::ScalingDecision);
        let bus = EventBus::new(config);
        let mut rx = bus.subscribe();

        bus.publish(CrawlEvent::pool_status(4, 1, 3, CircuitState::Closed));
        bus.publish(CrawlEvent::scaling_decision(ScalingAction::ScaleUp, 20, 30, "backlog"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.category(), EventCategory::ScalingDecision);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_oldest() {
        let bus = EventBus::new(ObservabilityConfig {
            channel_capacity: 2,
            ..ObservabilityConfig::default()
        });
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(CrawlEvent::pool_status(n, 0, n, CircuitState::Closed));
        }

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        match rx.recv().await.unwrap().kind {
            EventKind::PoolStatus { size, .. } => assert_eq!(size, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(ObservabilityConfig::default());
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(CrawlEvent::task_started(
            TaskId::new("t"),
            WorkerId::numbered(1),
            "Guide",
            0,
            0,
        ));
    }

    struct Collect(Arc<Mutex<Vec<CrawlEvent>>>);

    #[async_trait]
    impl EventSubscriber for Collect {
        async fn on_event(&mut self, event: CrawlEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn test_spawned_subscriber_receives_until_cancelled() {
        let bus = EventBus::new(ObservabilityConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let handle = spawn_subscriber(&bus, Collect(seen.clone()), cancel.clone());

        bus.publish(CrawlEvent::pool_status(2, 1, 1, CircuitState::Open));
        tokio::task::yield_now().await;
        while seen.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_yields_events() {
        let bus = EventBus::new(ObservabilityConfig::default());
        let mut stream = Box::pin(bus.stream());
        bus.publish(CrawlEvent::scaling_decision(ScalingAction::Hold, 5, 5, "steady"));
        let event = stream.next().await.unwrap();
        assert_eq!(event.category(), EventCategory::ScalingDecision);
    }
}
