use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

use crate::event::Event;

/// A subscribed event handler. Handlers run synchronously on the publisher's
/// thread, so they must hand off anything slow instead of blocking dispatch.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// In-process publish/subscribe primitive.
///
/// Dispatch is synchronous: every current subscriber is invoked in
/// subscription order before [`EventBus::publish`] returns. A panicking
/// handler is caught and logged here — it never reaches the publisher and
/// never stops delivery to the remaining subscribers. The bus keeps no
/// history; once dispatched, an event is gone.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Remove a subscription. Returns `false` when the handle is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: &Event) {
        // Snapshot the list so a handler that subscribes or publishes
        // reentrantly never deadlocks against the dispatch loop.
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, handler) in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let message = panic_message(&panic);
                error!(
                    subscription = id.0,
                    event_type = %event.event_type,
                    "event handler panicked: {message}"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::payload;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn recording_handler(log: Arc<StdMutex<Vec<String>>>, tag: &'static str) -> Handler {
        Arc::new(move |event: &Event| {
            log.lock()
                .unwrap()
                .push(format!("{tag}:{}", event.event_type));
        })
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(recording_handler(log.clone(), "a"));
        bus.subscribe(recording_handler(log.clone(), "b"));
        bus.subscribe(recording_handler(log.clone(), "c"));

        bus.publish(&Event::new("tick", payload(json!({}))));

        assert_eq!(*log.lock().unwrap(), vec!["a:tick", "b:tick", "c:tick"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(recording_handler(log.clone(), "first"));
        bus.subscribe(Arc::new(|_event: &Event| panic!("boom")));
        bus.subscribe(recording_handler(log.clone(), "last"));

        bus.publish(&Event::new("tick", payload(json!({}))));

        assert_eq!(*log.lock().unwrap(), vec!["first:tick", "last:tick"]);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let id = bus.subscribe(recording_handler(log.clone(), "gone"));
        bus.subscribe(recording_handler(log.clone(), "kept"));
        assert_eq!(bus.subscriber_count(), 2);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(&Event::new("tick", payload(json!({}))));

        assert_eq!(*log.lock().unwrap(), vec!["kept:tick"]);
    }

    #[test]
    fn reentrant_publish_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let inner_log = log.clone();
        let bus_clone = bus.clone();
        bus.subscribe(Arc::new(move |event: &Event| {
            if event.event_type == "outer" {
                bus_clone.publish(&Event::new("inner", payload(json!({}))));
            } else {
                inner_log.lock().unwrap().push(event.event_type.clone());
            }
        }));

        bus.publish(&Event::new("outer", payload(json!({}))));
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);
    }
}
