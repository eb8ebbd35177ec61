//! In-process publish/subscribe event bus.
//!
//! Each subscription owns a bounded queue drained by its own task, so a
//! subscriber sees events in emission order while a slow or panicking
//! subscriber cannot hold up the emitter or other subscribers. `emit` never
//! waits: when a subscriber's queue is full the event is dropped for that
//! subscriber only and counted.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{BridgeError, BridgeResult};

static TOPIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)*$").expect("valid regex"));

/// Whether `topic` is a concrete dot-namespaced topic.
pub fn is_valid_topic(topic: &str) -> bool {
    TOPIC.is_match(topic)
}

/// Whether `filter` is `*`, an exact topic, or `prefix.*`.
pub fn is_valid_filter(filter: &str) -> bool {
    filter == "*" || filter.strip_suffix(".*").map_or(is_valid_topic(filter), is_valid_topic)
}

/// Check a topic against a subscription filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == "*" {
        return true;
    }
    match filter.strip_suffix(".*") {
        Some(prefix) => {
            topic.len() > prefix.len() + 1
                && topic.starts_with(prefix)
                && topic.as_bytes()[prefix.len()] == b'.'
        }
        None => filter == topic,
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Subscription identifier.
pub type SubscriptionId = u64;

/// Mirrors events to an outer channel (push socket, webhook, ...).
pub trait EventPropagator: Send + Sync {
    fn propagate(&self, event: &Event);
}

/// Event bus sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Events kept for `history` queries.
    pub history_size: usize,
    /// Per-subscriber queue depth.
    pub subscriber_queue: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { history_size: 500, subscriber_queue: 256 }
    }
}

/// Summary of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Counters since the bus was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub emitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub panicked: u64,
    pub subscriptions: usize,
    pub history_len: usize,
}

struct Subscription {
    filter: String,
    owner: Option<String>,
    sender: mpsc::Sender<Event>,
    active: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

/// Publish/subscribe hub shared by the host and every unit.
pub struct EventBus {
    config: EventBusConfig,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    history: Mutex<VecDeque<Event>>,
    propagator: RwLock<Option<Arc<dyn EventPropagator>>>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config: EventBusConfig {
                history_size: config.history_size,
                subscriber_queue: config.subscriber_queue.max(1),
            },
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            propagator: RwLock::new(None),
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Install the external propagation hook, replacing any previous one.
    pub fn set_propagator(&self, propagator: Arc<dyn EventPropagator>) {
        *self.propagator.write() = Some(propagator);
    }

    pub fn clear_propagator(&self) {
        *self.propagator.write() = None;
    }

    /// Publish an event. Returns once the event is recorded and queued for
    /// every matching subscriber; never waits on subscriber callbacks.
    pub fn emit(&self, topic: &str, payload: serde_json::Value, source: Option<&str>) -> Event {
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
            source: source.map(str::to_string),
        };
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);

        if self.config.history_size > 0 {
            let mut history = self.history.lock();
            history.push_back(event.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        // Clone out of the lock so a propagator can emit without deadlocking.
        let propagator = self.propagator.read().clone();
        if let Some(propagator) = propagator {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| propagator.propagate(&event)));
            if result.is_err() {
                tracing::warn!(topic = %event.topic, "Event propagator panicked");
            }
        }

        let subscriptions = self.subscriptions.read();
        for (id, subscription) in subscriptions.iter() {
            if !topic_matches(&subscription.filter, topic) {
                continue;
            }
            subscription.queued.fetch_add(1, Ordering::AcqRel);
            if subscription.sender.try_send(event.clone()).is_err() {
                subscription.queued.fetch_sub(1, Ordering::AcqRel);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    subscription = id,
                    owner = subscription.owner.as_deref().unwrap_or("host"),
                    topic = %topic,
                    "Subscriber queue full, dropping event"
                );
            }
        }

        event
    }

    /// Subscribe `callback` to topics matching `filter`. Must be called from
    /// within a tokio runtime; the delivery task is spawned on it.
    pub fn subscribe<F>(
        &self,
        filter: &str,
        callback: F,
        owner: Option<&str>,
    ) -> BridgeResult<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if !is_valid_filter(filter) {
            return Err(BridgeError::Validation(format!("invalid topic filter '{filter}'")));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BridgeError::Validation("event subscriptions require a tokio runtime".to_string())
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::channel::<Event>(self.config.subscriber_queue);
        let active = Arc::new(AtomicBool::new(true));
        let queued = Arc::new(AtomicUsize::new(0));

        let worker_active = Arc::clone(&active);
        let worker_queued = Arc::clone(&queued);
        let counters = Arc::clone(&self.counters);
        let owner_label = owner.unwrap_or("host").to_string();
        runtime.spawn(async move {
            while let Some(event) = receiver.recv().await {
                if worker_active.load(Ordering::Acquire) {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
                    match result {
                        Ok(()) => {
                            counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            counters.panicked.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                subscription = id,
                                owner = %owner_label,
                                topic = %event.topic,
                                "Event subscriber panicked"
                            );
                        }
                    }
                }
                worker_queued.fetch_sub(1, Ordering::AcqRel);
            }
        });

        self.subscriptions.write().insert(
            id,
            Subscription {
                filter: filter.to_string(),
                owner: owner.map(str::to_string),
                sender,
                active,
                queued,
            },
        );
        tracing::debug!(subscription = id, filter = %filter, owner = owner.unwrap_or("host"), "Subscribed");
        Ok(id)
    }

    /// Remove one subscription. Queued events are discarded.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.write().remove(&id) {
            Some(subscription) => {
                subscription.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Remove every subscription owned by a unit. Returns how many were removed.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let ids: Vec<SubscriptionId> = subscriptions
            .iter()
            .filter(|(_, s)| s.owner.as_deref() == Some(owner))
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(subscription) = subscriptions.remove(id) {
                subscription.active.store(false, Ordering::Release);
            }
        }
        if !ids.is_empty() {
            tracing::debug!(owner = %owner, count = ids.len(), "Removed subscriptions");
        }
        ids.len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut list: Vec<_> = self
            .subscriptions
            .read()
            .iter()
            .map(|(id, s)| SubscriptionInfo { id: *id, filter: s.filter.clone(), owner: s.owner.clone() })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    /// Recent events, oldest first, optionally filtered.
    pub fn history(&self, filter: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let matching: Vec<&Event> =
            history.iter().filter(|e| filter.map_or(true, |f| topic_matches(f, &e.topic))).collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.read().len(),
            history_len: self.history.lock().len(),
        }
    }

    /// Wait until every queued delivery has been handled, or `timeout`
    /// elapses. Returns false on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: usize = self
                .subscriptions
                .read()
                .values()
                .map(|s| s.queued.load(Ordering::Acquire))
                .sum();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::topics;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("*", "plugin.loaded"));
        assert!(topic_matches("plugin.*", "plugin.loaded"));
        assert!(topic_matches("plugin.*", "plugin.reload.failed"));
        assert!(!topic_matches("plugin.*", "plugin"));
        assert!(!topic_matches("plugin.*", "plugins.loaded"));
        assert!(topic_matches("job.completed", "job.completed"));
        assert!(!topic_matches("job.completed", "job.failed"));

        assert!(is_valid_filter("plugin.*"));
        assert!(is_valid_filter("*"));
        assert!(!is_valid_filter("plugin.*.x"));
        assert!(!is_valid_topic("Plugin.Loaded"));
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe("job.*", move |e| sink.lock().push(e.payload["n"].as_u64().unwrap_or(0)), None)
            .unwrap();

        for n in 0..50 {
            bus.emit(topics::JOB_PROGRESS, json!({ "n": n }), None);
        }
        bus.emit(topics::PLUGIN_LOADED, json!({ "n": 999 }), None);

        assert!(bus.flush(WAIT).await);
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_unsubscribe_owner_is_idempotent() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe("*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }, Some("acme.lint"))
        .unwrap();

        assert_eq!(bus.unsubscribe_owner("acme.lint"), 1);
        assert_eq!(bus.unsubscribe_owner("acme.lint"), 0);

        bus.emit(topics::PLUGIN_LOADED, json!({}), None);
        bus.flush(WAIT).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("plugin.*", |_| panic!("boom"), Some("acme.bad")).unwrap();
        let counter = Arc::clone(&hits);
        bus.subscribe("plugin.*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }, Some("acme.good"))
        .unwrap();

        bus.emit(topics::PLUGIN_LOADED, json!({}), None);
        bus.emit(topics::PLUGIN_ERROR, json!({}), None);
        assert!(bus.flush(WAIT).await);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().panicked, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_drops_for_that_subscriber_only() {
        let bus = EventBus::new(EventBusConfig { history_size: 10, subscriber_queue: 1 });
        let gate = Arc::new(std::sync::Barrier::new(2));
        let worker_gate = Arc::clone(&gate);
        bus.subscribe("slow.*", move |_| {
            worker_gate.wait();
        }, None)
        .unwrap();

        // The first event is picked up and blocks; one more fits the queue.
        bus.emit("slow.a", json!({}), None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit("slow.b", json!({}), None);
        bus.emit("slow.c", json!({}), None);

        assert_eq!(bus.stats().dropped, 1);
        gate.wait();
        gate.wait();
        assert!(bus.flush(WAIT).await);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = EventBus::new(EventBusConfig { history_size: 3, subscriber_queue: 8 });
        for n in 0..5 {
            bus.emit("tick", json!(n), Some("acme.clock"));
        }
        let history = bus.history(None, 10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].payload, json!(2));
        assert_eq!(history[2].source.as_deref(), Some("acme.clock"));
        assert_eq!(bus.history(Some("tick"), 1).len(), 1);
    }

    #[tokio::test]
    async fn test_propagator_sees_every_event() {
        struct Mirror(Mutex<Vec<String>>);
        impl EventPropagator for Mirror {
            fn propagate(&self, event: &Event) {
                self.0.lock().push(event.topic.clone());
            }
        }

        let bus = EventBus::default();
        let mirror = Arc::new(Mirror(Mutex::new(Vec::new())));
        bus.set_propagator(Arc::clone(&mirror) as Arc<dyn EventPropagator>);
        bus.emit(topics::CONFIG_CHANGED, json!({}), None);
        assert_eq!(*mirror.0.lock(), vec![topics::CONFIG_CHANGED.to_string()]);
    }

    #[test]
    fn test_subscribe_rejects_bad_filter() {
        let bus = EventBus::default();
        let err = bus.subscribe("Bad Topic", |_| {}, None).unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }
}
