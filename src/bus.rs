// =============================================================================
// Event Bus — in-process topic-addressed pub/sub
// =============================================================================
//
// Thin wrapper over `tokio::sync::broadcast`, which matches the required
// delivery contract exactly: FIFO per publisher, at-most-once within a
// process lifetime, and a slow subscriber loses its *oldest* buffered
// events without ever delaying a publisher. Topic filtering happens on the
// subscriber side; the lag counter per subscription records how many
// events that subscriber shed.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::events::{Event, EventKind, LogLevel};

/// Subscriber-side topic selector.
#[derive(Debug, Clone)]
pub enum TopicFilter {
    /// `*` — every event.
    All,
    /// Only events whose topic is in the list.
    Topics(Vec<&'static str>),
}

impl TopicFilter {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Topics(list) => list.contains(&topic),
        }
    }
}

/// Many-producer / many-consumer event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event built from `kind`. Never blocks; an event with no
    /// live subscribers is simply dropped.
    pub fn publish(&self, kind: EventKind) -> Event {
        let event = Event::new(kind);
        self.publish_event(event.clone());
        event
    }

    /// Publish a pre-built (e.g. correlated) event.
    pub fn publish_event(&self, event: Event) {
        trace!(topic = event.topic(), "bus publish");
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(event);
    }

    /// Shorthand for a `SystemLog` event.
    pub fn log(&self, level: LogLevel, source: &str, message: impl Into<String>) {
        self.publish(EventKind::SystemLog {
            level,
            source: source.to_string(),
            message: message.into(),
            metadata: None,
        });
    }

    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
            dropped: 0,
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: TopicFilter,
    dropped: u64,
}

impl Subscription {
    /// Receive the next matching event. Returns `None` once the bus is
    /// gone. Lagged gaps are absorbed into the dropped counter and the
    /// stream continues from the oldest retained event.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Events this subscriber shed because it fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
