//! In-process event bus between the transport and its consumers.
//!
//! Built on a tokio broadcast channel: one send reaches every subscriber,
//! each subscriber buffers up to `capacity` events and a lagging one
//! loses the oldest events instead of stalling the transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::protocol::{Envelope, EnvelopeKind, ProjectId};

/// Everything the transport reports.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Socket open for the project.
    Connected { project_id: ProjectId },
    /// Socket closed. `code` 1000 means intentional.
    Disconnected { code: u16, reason: String },
    /// A reconnect is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Transport fault. `terminal` means retrying has stopped.
    Error { message: String, terminal: bool },
    /// A decoded inbound envelope.
    Inbound(Envelope),
}

/// Discriminant of [`CollabEvent`], used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
    Inbound(EnvelopeKind),
}

impl CollabEvent {
    /// Discriminant used by filtered subscriptions.
    pub fn kind(&self) -> EventKind {
        match self {
            CollabEvent::Connected { .. } => EventKind::Connected,
            CollabEvent::Disconnected { .. } => EventKind::Disconnected,
            CollabEvent::Reconnecting { .. } => EventKind::Reconnecting,
            CollabEvent::Error { .. } => EventKind::Error,
            CollabEvent::Inbound(envelope) => EventKind::Inbound(envelope.kind()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub lagged: u64,
    pub subscribers: usize,
}

struct AtomicBusStats {
    published: AtomicU64,
    lagged: AtomicU64,
}

/// Cloneable publish/subscribe handle.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CollabEvent>,
    stats: Arc<AtomicBusStats>,
}

impl EventBus {
    /// Create a bus; each subscriber buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(AtomicBusStats {
                published: AtomicU64::new(0),
                lagged: AtomicU64::new(0),
            }),
        }
    }

    /// Publish to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: CollabEvent) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: None,
            stats: self.stats.clone(),
        }
    }

    /// Receive only the listed kinds.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: Some(kinds.to_vec()),
            stats: self.stats.clone(),
        }
    }

    /// Get bus statistics.
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            lagged: self.stats.lagged.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// A typed receiver, optionally filtered by [`EventKind`].
pub struct Subscription {
    receiver: broadcast::Receiver<CollabEvent>,
    filter: Option<Vec<EventKind>>,
    stats: Arc<AtomicBusStats>,
}

impl Subscription {
    /// Next matching event; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<CollabEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.stats.lagged.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!("event subscriber lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, event: &CollabEvent) -> bool {
        match &self.filter {
            Some(kinds) => kinds.contains(&event.kind()),
            None => true,
        }
    }
}
