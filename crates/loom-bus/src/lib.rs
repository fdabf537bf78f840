//! In-process event bus built on bounded flume channels.
//!
//! Each subscriber gets a dedicated bounded channel and an optional filter.
//! Publication never blocks: when a subscriber's buffer is full the oldest
//! event is dropped and the subscriber's drop counter incremented.
//! Subscribers receive only events published after they subscribed; ordering
//! is per-subscriber, not global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use loom_core::types::Event;
use tracing::debug;

/// Default per-subscriber buffer depth.
pub const DEFAULT_BUFFER: usize = 256;

/// Predicate deciding whether a subscriber sees an event.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Optional external bridge (e.g. a NATS adapter). The bus forwards every
/// published event to it; its absence changes no semantics.
pub trait RemoteBridge: Send + Sync {
    fn forward(&self, event: &Event);
}

struct Subscriber {
    tx: flume::Sender<Event>,
    /// Clone of the subscriber's receiver; used to pop the oldest buffered
    /// event when the channel is full.
    rx: flume::Receiver<Event>,
    filter: Option<EventFilter>,
    dropped: Arc<AtomicU64>,
}

struct Inner {
    subscribers: Mutex<HashMap<String, Subscriber>>,
    bridge: Mutex<Option<Arc<dyn RemoteBridge>>>,
    buffer: usize,
}

/// A broadcast-style event bus. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                bridge: Mutex::new(None),
                buffer,
            }),
        }
    }

    /// Register a named subscriber. Replaces (and closes) any previous
    /// subscriber of the same name.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: Option<EventFilter>,
    ) -> flume::Receiver<Event> {
        let (tx, rx) = flume::bounded(self.inner.buffer);
        let name = name.into();
        let mut subs = self.inner.subscribers.lock().expect("bus lock poisoned");
        subs.insert(
            name,
            Subscriber {
                tx,
                rx: rx.clone(),
                filter,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        );
        rx
    }

    /// Remove a subscriber, closing its channel.
    pub fn unsubscribe(&self, name: &str) {
        let mut subs = self.inner.subscribers.lock().expect("bus lock poisoned");
        subs.remove(name);
    }

    /// Publish to all matching subscribers. Non-blocking: slow subscribers
    /// drop their oldest buffered event.
    pub fn publish(&self, event: Event) {
        if let Some(bridge) = self.inner.bridge.lock().expect("bus lock poisoned").as_ref() {
            bridge.forward(&event);
        }

        let mut subs = self.inner.subscribers.lock().expect("bus lock poisoned");
        subs.retain(|name, sub| {
            // The bus itself holds one receiver clone for the drop-oldest
            // pop, so a count of one means the external receiver is gone.
            if sub.tx.receiver_count() <= 1 {
                debug!(subscriber = %name, "pruning abandoned subscriber");
                return false;
            }
            if let Some(filter) = &sub.filter {
                if !filter(&event) {
                    return true;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(ev)) => {
                    // Pop the oldest buffered event to make room.
                    let _ = sub.rx.try_recv();
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %name, "event bus buffer full, dropped oldest");
                    sub.tx.try_send(ev).is_ok()
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Number of events dropped for a subscriber so far.
    pub fn dropped(&self, name: &str) -> u64 {
        let subs = self.inner.subscribers.lock().expect("bus lock poisoned");
        subs.get(name)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().expect("bus lock poisoned").len()
    }

    /// Attach the remote bridge collaborator.
    pub fn set_bridge(&self, bridge: Arc<dyn RemoteBridge>) {
        *self.inner.bridge.lock().expect("bus lock poisoned") = Some(bridge);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, project: &str) -> Event {
        Event::new(event_type, "test").with_project(project)
    }

    #[test]
    fn subscriber_receives_after_subscription() {
        let bus = EventBus::new();
        bus.publish(event("early", "p"));
        let rx = bus.subscribe("late", None);
        bus.publish(event("late", "p"));

        let got = rx.try_recv().unwrap();
        assert_eq!(got.event_type, "late");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn filter_limits_delivery() {
        let bus = EventBus::new();
        let filter: EventFilter = Arc::new(|e: &Event| e.project_id.as_deref() == Some("alpha"));
        let rx = bus.subscribe("alpha-only", Some(filter));

        bus.publish(event("e1", "alpha"));
        bus.publish(event("e2", "beta"));
        bus.publish(event("e3", "alpha"));

        let received: Vec<_> = rx.try_iter().map(|e| e.event_type).collect();
        assert_eq!(received, vec!["e1", "e3"]);
    }

    #[test]
    fn unsubscribe_closes_channel() {
        let bus = EventBus::new();
        let rx = bus.subscribe("s", None);
        bus.unsubscribe("s");
        bus.publish(event("e", "p"));
        assert!(matches!(rx.try_recv(), Err(flume::TryRecvError::Disconnected)));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let bus = EventBus::with_buffer(2);
        let rx = bus.subscribe("slow", None);
        for i in 0..5 {
            bus.publish(event(&format!("e{i}"), "p"));
        }
        assert_eq!(bus.dropped("slow"), 3);
        // The two newest events survive.
        let kept: Vec<_> = rx.try_iter().map(|e| e.event_type).collect();
        assert_eq!(kept, vec!["e3", "e4"]);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe("gone", None);
        }
        bus.publish(event("e", "p"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn abandoned_subscriber_does_not_buffer_future_events() {
        let bus = EventBus::with_buffer(2);
        let kept = bus.subscribe("kept", None);
        drop(bus.subscribe("gone", None));

        for i in 0..4 {
            bus.publish(event(&format!("e{i}"), "p"));
        }
        // The abandoned subscriber is gone after the first publish and
        // never accumulates drops; the live one still receives.
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.dropped("gone"), 0);
        assert_eq!(kept.try_iter().count(), 2);
    }

    #[test]
    fn bridge_sees_all_events() {
        use std::sync::atomic::AtomicUsize;

        struct CountingBridge(AtomicUsize);
        impl RemoteBridge for CountingBridge {
            fn forward(&self, _event: &Event) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let bus = EventBus::new();
        let bridge = Arc::new(CountingBridge(AtomicUsize::new(0)));
        bus.set_bridge(bridge.clone());
        bus.publish(event("e1", "p"));
        bus.publish(event("e2", "p"));
        assert_eq!(bridge.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn resubscribe_replaces_previous() {
        let bus = EventBus::new();
        let old = bus.subscribe("s", None);
        let new = bus.subscribe("s", None);
        bus.publish(event("e", "p"));
        assert!(matches!(old.try_recv(), Err(flume::TryRecvError::Disconnected)));
        assert_eq!(new.try_recv().unwrap().event_type, "e");
    }
}
