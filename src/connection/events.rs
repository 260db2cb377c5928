//! Client events
//!
//! Lifecycle and diagnostic notifications fanned out to every subscriber in
//! emission order.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::protocol::WireMessage;
use crate::error::DaemonError;

/// How unsolicited traffic was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamKind {
    /// A response nobody is waiting for (late, cancelled, or broadcast)
    Ack,
    /// A request-type frame with no local counterpart
    Request,
}

/// A notification from the client.
#[derive(Debug, Clone)]
pub enum Event {
    /// Registration succeeded and requests are flowing
    Open,
    /// An established connection ended
    Close(DaemonError),
    /// A connect attempt failed before registration completed
    ConnectError(DaemonError),
    /// The daemon answered a ping
    Heartbeat,
    /// Unsolicited traffic
    Spam { kind: SpamKind, message: WireMessage },
    /// Free-form diagnostics
    Debug(String),
}

/// Discriminant of [`Event`], for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    ConnectError,
    Heartbeat,
    Spam,
    Debug,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Close(_) => EventKind::Close,
            Self::ConnectError(_) => EventKind::ConnectError,
            Self::Heartbeat => EventKind::Heartbeat,
            Self::Spam { .. } => EventKind::Spam,
            Self::Debug(_) => EventKind::Debug,
        }
    }
}

/// Event broadcaster
///
/// Each subscriber buffers up to `capacity` events (1000 by default). One that
/// falls further behind skips the oldest and can read how many it lost from
/// [`Subscription::missed`].
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(message = %message, "Client debug event");
        self.emit(Event::Debug(message));
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind: None,
            missed: 0,
        }
    }

    pub fn subscribe_to(&self, kind: EventKind) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind: Some(kind),
            missed: 0,
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// A receiver of client events, optionally limited to one kind.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    kind: Option<EventKind>,
    missed: u64,
}

impl Subscription {
    /// The next matching event, or `None` once the client is gone.
    ///
    /// A subscriber that falls too far behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => self.lagged(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// A matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.lagged(n),
                Err(_) => return None,
            }
        }
    }

    /// Events dropped because this subscriber fell behind, of any kind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn lagged(&mut self, skipped: u64) {
        self.missed += skipped;
        warn!(skipped = skipped, total = self.missed, "Event subscriber lagged");
    }

    fn matches(&self, event: &Event) -> bool {
        self.kind.map_or(true, |kind| event.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filtered_subscription() {
        let hub = EventHub::default();
        let mut all = hub.subscribe();
        let mut heartbeats = hub.subscribe_to(EventKind::Heartbeat);

        hub.emit(Event::Open);
        hub.debug("hello");
        hub.emit(Event::Heartbeat);

        assert!(matches!(all.recv().await, Some(Event::Open)));
        assert!(matches!(all.recv().await, Some(Event::Debug(ref m)) if m == "hello"));
        assert!(matches!(heartbeats.recv().await, Some(Event::Heartbeat)));
        assert!(heartbeats.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_counts_missed() {
        let hub = EventHub::new(2);
        let mut sub = hub.subscribe();
        for i in 0..5 {
            hub.debug(format!("event {i}"));
        }

        assert!(matches!(sub.recv().await, Some(Event::Debug(ref m)) if m == "event 3"));
        assert_eq!(sub.missed(), 3);
        assert!(matches!(sub.try_recv(), Some(Event::Debug(ref m)) if m == "event 4"));
        assert!(sub.try_recv().is_none());
        assert_eq!(sub.missed(), 3);
    }

    #[tokio::test]
    async fn test_closed_hub_ends_subscription() {
        let hub = EventHub::default();
        let mut sub = hub.subscribe();
        drop(hub);
        assert!(sub.recv().await.is_none());
    }
}
