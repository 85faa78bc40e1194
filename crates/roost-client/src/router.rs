//! Topic routing for inbound PUBLISH packets.
//!
//! The client feeds every delivered message through a [`TopicRouter`].
//! [`TextRouter`] (the default) matches the exact topic text;
//! [`FilterRouter`] understands the `+` and `#` wildcards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use roost_core::{Publish, QoS};

/// Callback invoked with (topic, qos, payload) for each matched message.
pub type TopicHandler = Arc<dyn Fn(&str, QoS, &[u8]) + Send + Sync>;

/// Dispatches inbound messages to per-topic handlers.
pub trait TopicRouter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Associate a handler with a topic (or filter, router-dependent).
    fn add(&self, filter: &str, handler: TopicHandler);

    /// Remove every handler registered for `filter`.
    fn remove(&self, filter: &str);

    /// Route one message to all matching handlers.
    fn dispatch(&self, publish: &Publish);
}

/// Exact-text router: a handler fires only for the identical topic string.
#[derive(Default)]
pub struct TextRouter {
    routes: Mutex<HashMap<String, Vec<TopicHandler>>>,
}

impl TextRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<TopicHandler>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TopicRouter for TextRouter {
    fn name(&self) -> &'static str {
        "text"
    }

    fn add(&self, filter: &str, handler: TopicHandler) {
        self.lock().entry(filter.to_string()).or_default().push(handler);
    }

    fn remove(&self, filter: &str) {
        self.lock().remove(filter);
    }

    fn dispatch(&self, publish: &Publish) {
        let handlers: Vec<TopicHandler> = self
            .lock()
            .get(&publish.topic)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        for handler in handlers {
            handler(&publish.topic, publish.qos, &publish.payload);
        }
    }
}

/// Wildcard router matching MQTT topic filters.
#[derive(Default)]
pub struct FilterRouter {
    routes: Mutex<Vec<(String, TopicHandler)>>,
}

impl FilterRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, TopicHandler)>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TopicRouter for FilterRouter {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn add(&self, filter: &str, handler: TopicHandler) {
        self.lock().push((filter.to_string(), handler));
    }

    fn remove(&self, filter: &str) {
        self.lock().retain(|(f, _)| f != filter);
    }

    fn dispatch(&self, publish: &Publish) {
        let handlers: Vec<TopicHandler> = self
            .lock()
            .iter()
            .filter(|(filter, _)| topic_matches_filter(&publish.topic, filter))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(&publish.topic, publish.qos, &publish.payload);
        }
    }
}

/// Whether `topic` matches the filter pattern.
///
/// `+` matches one level, `#` the remainder. Topics starting with `$` are
/// never matched by a wildcard at the root level.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let dollar_topic = topic_levels.first().is_some_and(|l| l.starts_with('$'));
    let wildcard_root = filter_levels
        .first()
        .is_some_and(|l| *l == "#" || *l == "+");
    if dollar_topic && wildcard_root {
        return false;
    }

    let mut ti = 0;
    for level in &filter_levels {
        if *level == "#" {
            return true;
        }
        if ti >= topic_levels.len() {
            return false;
        }
        if *level != "+" && *level != topic_levels[ti] {
            return false;
        }
        ti += 1;
    }

    ti == topic_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn filter_matching() {
        assert!(topic_matches_filter("sensors/temp", "sensors/temp"));
        assert!(!topic_matches_filter("sensors/temp", "sensors/humidity"));

        assert!(topic_matches_filter("sensors/temp", "sensors/+"));
        assert!(!topic_matches_filter("sensors/room1/temp", "sensors/+"));

        assert!(topic_matches_filter("sensors/temp", "sensors/#"));
        assert!(topic_matches_filter("sensors/room1/temp", "sensors/#"));
        assert!(topic_matches_filter("sensors", "sensors/#"));

        assert!(topic_matches_filter("sensors/room1/temp", "sensors/+/temp"));
        assert!(!topic_matches_filter("sensors/room1/humidity", "sensors/+/temp"));

        assert!(!topic_matches_filter("$SYS/broker/clients", "#"));
        assert!(!topic_matches_filter("$SYS/broker/clients", "+/broker/clients"));
        assert!(topic_matches_filter("$SYS/broker/clients", "$SYS/#"));
    }

    #[test]
    fn text_router_matches_exactly() {
        let router = TextRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        router.add(
            "a/b",
            Arc::new(move |topic, _, payload| {
                assert_eq!(topic, "a/b");
                assert_eq!(payload, b"hi");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        router.dispatch(&Publish::new("a/b", QoS::AtMostOnce, &b"hi"[..]));
        router.dispatch(&Publish::new("a/+", QoS::AtMostOnce, &b"hi"[..]));
        router.dispatch(&Publish::new("a/b/c", QoS::AtMostOnce, &b"hi"[..]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        router.remove("a/b");
        router.dispatch(&Publish::new("a/b", QoS::AtMostOnce, &b"hi"[..]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn filter_router_matches_wildcards() {
        let router = FilterRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        router.add(
            "sensors/#",
            Arc::new(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        router.dispatch(&Publish::new("sensors/room1/temp", QoS::AtMostOnce, &b""[..]));
        router.dispatch(&Publish::new("actuators/valve", QoS::AtMostOnce, &b""[..]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
