//! Live event fan-out
//!
//! Every subscriber owns a bounded queue. Publishing never blocks: a
//! full queue drops its oldest undelivered event (drop-from-head) so a
//! slow consumer can only lose its own history, never stall the engine.

use crate::models::EngineEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::debug;

/// Queue capacity handed to subscribers that do not ask for one
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct SharedQueue {
    events: Mutex<VecDeque<EngineEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SharedQueue {
    fn push(&self, event: EngineEvent) {
        {
            let mut events = self.events.lock().unwrap();
            if events.len() >= self.capacity {
                events.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    event = "subscriber_overflow",
                    capacity = self.capacity,
                    dropped_total = dropped,
                    "Subscriber queue full, dropped oldest event"
                );
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Fan-out point for engine events
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<SharedQueue>>>,
    default_capacity: usize,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Register a subscriber with the default queue capacity
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.default_capacity)
    }

    /// Register a subscriber with an explicit queue capacity
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let queue = Arc::new(SharedQueue {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        self.subscribers.lock().unwrap().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    /// Deliver an event to every live subscriber, pruning dropped ones
    pub fn publish(&self, event: &EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event.clone());
                true
            }
            None => false,
        });
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Receiving end of one subscription; dropping it unsubscribes
pub struct Subscription {
    queue: Arc<SharedQueue>,
}

impl Subscription {
    /// Wait for the next event
    pub async fn recv(&mut self) -> EngineEvent {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.events.lock().unwrap().pop_front() {
                return event;
            }
            notified.await;
        }
    }

    /// Pop the next event without waiting
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.queue.events.lock().unwrap().pop_front()
    }

    /// Events lost to queue overflow since subscribing
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Currently queued events
    pub fn len(&self) -> usize {
        self.queue.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EngineState;

    fn state_event(state: EngineState) -> EngineEvent {
        EngineEvent::StateUpdate { state }
    }

    #[test]
    fn test_subscriber_receives_published_events() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        bus.publish(&state_event(EngineState::Cold));
        bus.publish(&state_event(EngineState::Ready));

        assert!(matches!(
            sub.try_recv(),
            Some(EngineEvent::StateUpdate {
                state: EngineState::Cold
            })
        ));
        assert!(matches!(
            sub.try_recv(),
            Some(EngineEvent::StateUpdate {
                state: EngineState::Ready
            })
        ));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_with_capacity(1);

        let states = [
            EngineState::Cold,
            EngineState::Training,
            EngineState::Ready,
            EngineState::Error,
            EngineState::Stopped,
        ];
        for state in states {
            bus.publish(&state_event(state));
        }

        // Capacity 1 under a burst of 5: the most recent event survives
        // and exactly 4 drops were recorded
        assert_eq!(sub.dropped_events(), 4);
        assert!(matches!(
            sub.try_recv(),
            Some(EngineEvent::StateUpdate {
                state: EngineState::Stopped
            })
        ));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_each_subscriber_gets_its_own_copy() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(&state_event(EngineState::Ready));

        assert!(first.try_recv().is_some());
        assert!(second.try_recv().is_some());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(&state_event(EngineState::Ready));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe();

        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(&state_event(EngineState::Ready));
        });

        let event = sub.recv().await;
        assert!(matches!(
            event,
            EngineEvent::StateUpdate {
                state: EngineState::Ready
            }
        ));
        handle.await.unwrap();
    }
}
