//! Event notifier.
//!
//! Publishers post [`DomainEvent`]s into an unbounded channel, so publishing
//! never blocks and never fails the operation that triggered it. A single
//! dispatch task drains the channel and fans events out to per-scope
//! broadcast topics plus a firehose topic.

use std::sync::Arc;

use dashmap::DashMap;
use mcphub_core::{DomainEvent, Scope};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Cheap, cloneable handle for publishing events.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl EventPublisher {
    /// Publish an event. Failures are logged, never returned.
    pub fn publish(&self, event: DomainEvent) {
        trace!(event = event.kind.name(), scope = %event.scope, "Publishing event");
        if let Err(e) = self.tx.send(event) {
            debug!(event = e.0.kind.name(), "Event notifier is not running; dropping event");
        }
    }

    /// A publisher whose events go nowhere.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Fans published events out to subscribers.
pub struct EventNotifier {
    topics: Arc<DashMap<Scope, broadcast::Sender<DomainEvent>>>,
    firehose: broadcast::Sender<DomainEvent>,
    capacity: usize,
    task: JoinHandle<()>,
}

impl EventNotifier {
    /// Start the dispatch task. `capacity` bounds each topic's backlog;
    /// subscribers that fall further behind observe a lag.
    pub fn start(capacity: usize) -> (Self, EventPublisher) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = Arc::new(DashMap::new());
        let (firehose, _) = broadcast::channel(capacity);

        let task = tokio::spawn(dispatch(rx, Arc::clone(&topics), firehose.clone()));

        (
            Self {
                topics,
                firehose,
                capacity,
                task,
            },
            EventPublisher { tx },
        )
    }

    /// Subscribe to the events of one scope.
    pub fn subscribe(&self, scope: &Scope) -> broadcast::Receiver<DomainEvent> {
        self.topics
            .entry(scope.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to every event regardless of scope.
    pub fn subscribe_all(&self) -> broadcast::Receiver<DomainEvent> {
        self.firehose.subscribe()
    }

    /// Number of scopes with a live topic.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<DomainEvent>,
    topics: Arc<DashMap<Scope, broadcast::Sender<DomainEvent>>>,
    firehose: broadcast::Sender<DomainEvent>,
) {
    while let Some(event) = rx.recv().await {
        let name = event.kind.name();

        if firehose.receiver_count() > 0 {
            let _ = firehose.send(event.clone());
        }

        let delivered = match topics.get(&event.scope) {
            Some(topic) => topic.send(event.clone()).is_ok(),
            None => false,
        };

        if !delivered {
            debug!(event = name, scope = %event.scope, "No subscribers for event");
            topics.remove_if(&event.scope, |_, topic| topic.receiver_count() == 0);
        }
    }
    debug!("Event dispatch stopped");
}
