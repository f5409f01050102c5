//! Publish/subscribe for orchestrator notifications.
//!
//! Each listener call is isolated: an error or a panic in one listener is
//! logged and the remaining listeners still receive the event.

use prism_shared::{EventKind, OrchestratorEvent, PrismError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cache::lock;

pub trait Listener: Send + Sync {
    fn on_event(&self, event: &OrchestratorEvent) -> Result<(), PrismError>;
}

impl<F> Listener for F
where
    F: Fn(&OrchestratorEvent) -> Result<(), PrismError> + Send + Sync,
{
    fn on_event(&self, event: &OrchestratorEvent) -> Result<(), PrismError> {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: ListenerId,
    /// None means every kind
    kinds: Option<Vec<EventKind>>,
    listener: Arc<dyn Listener>,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map(|k| k.contains(&kind)).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event
    pub fn subscribe(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.add(None, listener)
    }

    /// Receive only the given kinds
    pub fn subscribe_to(&self, kinds: &[EventKind], listener: Arc<dyn Listener>) -> ListenerId {
        self.add(Some(kinds.to_vec()), listener)
    }

    fn add(&self, kinds: Option<Vec<EventKind>>, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.subscriptions).push(Subscription {
            id,
            kinds,
            listener,
        });
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subs = lock(&self.subscriptions);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Deliver to matching listeners. Returns how many accepted the event.
    pub fn publish(&self, event: &OrchestratorEvent) -> usize {
        let kind = event.kind();
        // Snapshot so listeners may (un)subscribe while being called
        let targets: Vec<(ListenerId, Arc<dyn Listener>)> = lock(&self.subscriptions)
            .iter()
            .filter(|s| s.wants(kind))
            .map(|s| (s.id, Arc::clone(&s.listener)))
            .collect();

        let mut delivered = 0;
        for (id, listener) in targets {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Listener {:?} failed on {:?}: {}", id, kind, e),
                Err(_) => error!("Listener {:?} panicked on {:?}", id, kind),
            }
        }
        debug!("Published {:?} to {} listeners", kind, delivered);
        delivered
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Listener for ChannelListener {
    fn on_event(&self, event: &OrchestratorEvent) -> Result<(), PrismError> {
        self.tx
            .send(event.clone())
            .map_err(|_| PrismError::Collaborator("event receiver dropped".to_string()))
    }
}

/// Keeps every event it receives
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<OrchestratorEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.events).iter().filter(|e| e.kind() == kind).count()
    }
}

impl Listener for RecordingListener {
    fn on_event(&self, event: &OrchestratorEvent) -> Result<(), PrismError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_changed() -> OrchestratorEvent {
        OrchestratorEvent::ModeChanged {
            from: "contemplative".to_string(),
            to: "energetic".to_string(),
        }
    }

    #[test]
    fn test_failing_and_panicking_listeners_are_isolated() {
        let bus = EventBus::new();
        let recorder = Arc::new(RecordingListener::new());

        bus.subscribe(Arc::new(|_: &OrchestratorEvent| -> Result<(), PrismError> {
            Err(PrismError::Collaborator("boom".to_string()))
        }));
        bus.subscribe(Arc::new(|_: &OrchestratorEvent| -> Result<(), PrismError> {
            panic!("listener bug")
        }));
        bus.subscribe(recorder.clone());

        let delivered = bus.publish(&mode_changed());
        assert_eq!(delivered, 1);
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn test_kind_filter() {
        let bus = EventBus::new();
        let recorder = Arc::new(RecordingListener::new());
        bus.subscribe_to(&[EventKind::AdaptationOccurred], recorder.clone());
        bus.publish(&mode_changed());
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let recorder = Arc::new(RecordingListener::new());
        let id = bus.subscribe(recorder.clone());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&mode_changed());
        assert_eq!(recorder.count(EventKind::ModeChanged), 0);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let bus = EventBus::new();
        let (listener, mut rx) = ChannelListener::new();
        bus.subscribe(Arc::new(listener));
        bus.publish(&mode_changed());
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::ModeChanged);
    }
}
