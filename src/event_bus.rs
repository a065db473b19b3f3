//! EventBus — synchronous publish/subscribe.
//!
//! Grounded verbatim on `core_runtime/event_bus.py`: handlers are
//! registered per-topic with a counter-assigned id when none is supplied,
//! `publish` invokes every subscriber in registration order and swallows
//! (logging instead of propagating) a panicking handler so one bad
//! subscriber can't take down the rest, and `unsubscribe`/`clear` operate
//! by topic and handler id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// A subscriber callback. Receives the published payload.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscription {
    handler_id: String,
    handler: Handler,
}

/// In-process synchronous event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<HashMap<String, Vec<Subscription>>>>,
    counter: Arc<AtomicUsize>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribe `handler` to `topic`. Returns the assigned handler id
    /// (`h0`, `h1`, ... if `handler_id` is not supplied), usable with
    /// [`Self::unsubscribe`].
    pub fn subscribe(&self, topic: &str, handler: Handler, handler_id: Option<String>) -> String {
        let id = handler_id.unwrap_or_else(|| format!("h{}", self.counter.fetch_add(1, Ordering::SeqCst)));
        self.inner
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { handler_id: id.clone(), handler });
        id
    }

    /// Publish `payload` to every subscriber of `topic`, in registration
    /// order. A handler that panics is caught and logged; the remaining
    /// subscribers still run.
    pub fn publish(&self, topic: &str, payload: &Value) {
        let subs: Vec<Handler> = {
            let inner = self.inner.lock();
            match inner.get(topic) {
                Some(v) => v.iter().map(|s| s.handler.clone()).collect(),
                None => return,
            }
        };
        for handler in subs {
            let payload = payload.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&payload)));
            if let Err(_panic) = result {
                tracing::warn!(topic = %topic, "event bus handler panicked; continuing");
            }
        }
    }

    /// Remove a single subscriber by id. Returns whether it was found.
    pub fn unsubscribe(&self, topic: &str, handler_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(subs) = inner.get_mut(topic) else { return false };
        let before = subs.len();
        subs.retain(|s| s.handler_id != handler_id);
        let removed = subs.len() < before;
        if subs.is_empty() {
            inner.remove(topic);
        }
        removed
    }

    /// List handler ids subscribed to `topic`, in registration order.
    pub fn list_subscribers(&self, topic: &str) -> Vec<String> {
        self.inner
            .lock()
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.handler_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Clear subscribers for `topic`, or every topic when `None`.
    pub fn clear(&self, topic: Option<&str>) {
        match topic {
            Some(t) => {
                self.inner.lock().remove(t);
            }
            None => self.inner.lock().clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn publish_invokes_subscribers_in_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_a = log.clone();
        let log_b = log.clone();
        bus.subscribe("flow.started", Arc::new(move |_| log_a.lock().push("a")), None);
        bus.subscribe("flow.started", Arc::new(move |_| log_b.lock().push("b")), None);

        bus.publish("flow.started", &json!({"flow_id": "x"}));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_remaining_subscribers() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = ran.clone();
        bus.subscribe("x", Arc::new(|_| panic!("boom")), None);
        bus.subscribe("x", Arc::new(move |_| { ran_clone.fetch_add(1, Ordering::SeqCst); }), None);

        bus.publish("x", &Value::Null);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_only_matching_handler() {
        let bus = EventBus::new();
        let id_a = bus.subscribe("t", Arc::new(|_| {}), None);
        let _id_b = bus.subscribe("t", Arc::new(|_| {}), None);

        assert!(bus.unsubscribe("t", &id_a));
        assert_eq!(bus.list_subscribers("t").len(), 1);
        assert!(!bus.unsubscribe("t", "not-found"));
    }

    #[test]
    fn clear_all_empties_every_topic() {
        let bus = EventBus::new();
        bus.subscribe("a", Arc::new(|_| {}), None);
        bus.subscribe("b", Arc::new(|_| {}), None);
        bus.clear(None);
        assert!(bus.list_subscribers("a").is_empty());
        assert!(bus.list_subscribers("b").is_empty());
    }

    #[test]
    fn explicit_handler_id_is_honored() {
        let bus = EventBus::new();
        let id = bus.subscribe("t", Arc::new(|_| {}), Some("custom".to_string()));
        assert_eq!(id, "custom");
        assert_eq!(bus.list_subscribers("t"), vec!["custom".to_string()]);
    }
}
