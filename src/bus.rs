//! Topic-routed event bus
//!
//! A lighter sibling of the pipeline for fire-and-forget notification
//! fan-out. Publishers enqueue [`BusEvent`]s; a delivery loop routes
//! each event to subscribers by topic, supporting the global `"*"`
//! wildcard and `"prefix.*"` matching. When the queue is full the
//! incoming event is dropped (drop-newest), never an older one.
//!
//! Subscribers run under a per-handler timeout so one stuck subscriber
//! cannot wedge delivery for everyone else.

use crate::dedup::IdempotencySet;
use crate::error::HandlerError;
use crate::item::derive_key;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Bus tuning knobs
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Bounded queue capacity; overflow drops the newest event
    pub queue_capacity: usize,
    /// Per-handler delivery timeout
    pub handler_timeout: Duration,
    /// How long an event id is remembered for duplicate rejection
    pub seen_window: Duration,
    /// Delivery-loop idle wait before re-checking the running flag
    pub idle_wait: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            handler_timeout: Duration::from_secs(30),
            seen_window: Duration::from_secs(3600),
            idle_wait: Duration::from_millis(500),
        }
    }
}

/// A notification flowing over the bus
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Derived identity, stable for the same topic + payload + instant
    pub event_id: String,
    /// Dotted routing topic, e.g. `"opportunity.discovered"`
    pub topic: String,
    /// Origin identifier
    pub source: String,
    /// Opaque payload
    pub payload: Bytes,
    /// Unix timestamp in nanoseconds, set at creation
    pub published_at: i64,
}

impl BusEvent {
    /// Create an event with a content-derived id
    ///
    /// The creation timestamp participates in the hash, so the same
    /// payload published at different times yields distinct events
    /// while a double-publish of one event object is caught.
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        let topic = topic.into();
        let published_at = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let event_id = derive_key(&topic, &published_at.to_string(), &payload);
        Self {
            event_id,
            topic,
            source: String::new(),
            payload,
            published_at,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Subscriber callback for bus events
#[async_trait]
pub trait TopicHandler: Send + Sync {
    /// Stable name, used for logs and unsubscription
    fn name(&self) -> &str;

    async fn handle(&self, event: &BusEvent) -> Result<(), HandlerError>;
}

/// Whether a subscription pattern matches a concrete topic
fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic || pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false);
    }
    false
}

/// Point-in-time bus counters
#[derive(Debug, Clone)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped_duplicate: u64,
    pub dropped_backpressure: u64,
    pub handler_errors: u64,
    pub queue_depth: usize,
    pub patterns: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_backpressure: AtomicU64,
    handler_errors: AtomicU64,
}

struct BusShared {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn TopicHandler>>>>,
    dedup: IdempotencySet,
    counters: Counters,
    running: AtomicBool,
    handler_timeout: Duration,
    queue_capacity: usize,
}

impl BusShared {
    /// Handlers for a topic: exact subscribers first, then `"*"`, then
    /// prefix patterns
    fn matching_handlers(&self, topic: &str) -> Vec<Arc<dyn TopicHandler>> {
        let subscribers = self.subscribers.read();
        let mut matched = Vec::new();
        if let Some(exact) = subscribers.get(topic) {
            matched.extend(exact.iter().cloned());
        }
        if let Some(global) = subscribers.get("*") {
            matched.extend(global.iter().cloned());
        }
        for (pattern, handlers) in subscribers.iter() {
            if pattern != topic && pattern != "*" && topic_matches(pattern, topic) {
                matched.extend(handlers.iter().cloned());
            }
        }
        matched
    }

    async fn deliver(&self, event: &BusEvent) {
        let handlers = self.matching_handlers(&event.topic);
        if handlers.is_empty() {
            tracing::debug!(topic = %event.topic, "no subscribers for event");
            return;
        }

        for handler in &handlers {
            match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
                Ok(Ok(())) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::try_record_handler_error(handler.name());
                    tracing::warn!(
                        handler = handler.name(),
                        topic = %event.topic,
                        error = %err,
                        "subscriber failed"
                    );
                }
                Err(_) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::try_record_handler_error(handler.name());
                    tracing::error!(
                        handler = handler.name(),
                        topic = %event.topic,
                        timeout_secs = self.handler_timeout.as_secs_f64(),
                        "subscriber timed out"
                    );
                }
            }
        }
    }
}

/// Publisher- and subscriber-facing side of the bus
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<BusEvent>,
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Create the bus, returning the handle and its delivery-loop runner
    pub fn new(config: EventBusConfig) -> (Self, BusRunner) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(BusShared {
            subscribers: RwLock::new(HashMap::new()),
            dedup: IdempotencySet::new(config.seen_window),
            counters: Counters::default(),
            running: AtomicBool::new(true),
            handler_timeout: config.handler_timeout,
            queue_capacity: config.queue_capacity,
        });
        let bus = Self {
            tx,
            shared: Arc::clone(&shared),
        };
        let runner = BusRunner {
            rx,
            shared,
            idle_wait: config.idle_wait,
        };
        (bus, runner)
    }

    /// Subscribe a handler to a topic pattern
    ///
    /// Patterns: exact topic, `"*"` for everything, or `"prefix.*"`.
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn TopicHandler>) {
        let pattern = pattern.into();
        tracing::debug!(pattern = %pattern, handler = handler.name(), "subscribed");
        self.shared
            .subscribers
            .write()
            .entry(pattern)
            .or_default()
            .push(handler);
    }

    /// Remove a handler from a pattern by name
    pub fn unsubscribe(&self, pattern: &str, name: &str) -> bool {
        let mut subscribers = self.shared.subscribers.write();
        if let Some(handlers) = subscribers.get_mut(pattern) {
            let before = handlers.len();
            handlers.retain(|h| h.name() != name);
            let removed = handlers.len() < before;
            if handlers.is_empty() {
                subscribers.remove(pattern);
            }
            return removed;
        }
        false
    }

    /// Publish an event for asynchronous delivery
    ///
    /// Returns `true` if the event was accepted. Duplicates and queue
    /// overflow return `false`; overflow drops this (newest) event.
    pub fn publish(&self, event: BusEvent) -> bool {
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);

        if !self.shared.dedup.mark_seen(&event.event_id) {
            self.shared
                .counters
                .dropped_duplicate
                .fetch_add(1, Ordering::Relaxed);
            crate::metrics::try_record_drop("duplicate");
            tracing::debug!(event_id = %event.event_id, "duplicate event dropped");
            return false;
        }

        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(e)) => {
                // Not enqueued, so the id must stay republishable
                self.shared.dedup.forget(&e.event_id);
                self.shared
                    .counters
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                crate::metrics::try_record_drop("queue_full");
                tracing::warn!(topic = %e.topic, "bus queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(e)) => {
                self.shared.dedup.forget(&e.event_id);
                tracing::debug!(topic = %e.topic, "bus closed, event dropped");
                false
            }
        }
    }

    /// Publish and deliver inline, awaiting all subscribers
    ///
    /// For callers that need delivery before proceeding (tests, ordered
    /// teardown). Subject to the same duplicate rejection.
    pub async fn publish_and_wait(&self, event: BusEvent) -> bool {
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);

        if !self.shared.dedup.mark_seen(&event.event_id) {
            self.shared
                .counters
                .dropped_duplicate
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.shared.deliver(&event).await;
        true
    }

    /// Signal the delivery loop to stop
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        tracing::info!("bus stop requested");
    }

    /// Point-in-time counters
    pub fn stats(&self) -> BusStats {
        let counters = &self.shared.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped_duplicate: counters.dropped_duplicate.load(Ordering::Relaxed),
            dropped_backpressure: counters.dropped_backpressure.load(Ordering::Relaxed),
            handler_errors: counters.handler_errors.load(Ordering::Relaxed),
            queue_depth: self.shared.queue_capacity - self.tx.capacity(),
            patterns: self.shared.subscribers.read().len(),
        }
    }
}

/// Owns the delivery loop; consumed by `run()`
pub struct BusRunner {
    rx: mpsc::Receiver<BusEvent>,
    shared: Arc<BusShared>,
    idle_wait: Duration,
}

impl BusRunner {
    pub async fn run(mut self) {
        tracing::info!("bus delivery loop started");

        while self.shared.running.load(Ordering::Relaxed) {
            match tokio::time::timeout(self.idle_wait, self.rx.recv()).await {
                Ok(Some(event)) => self.shared.deliver(&event).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        tracing::info!(
            delivered = self.shared.counters.delivered.load(Ordering::Relaxed),
            "bus delivery loop stopped"
        );
    }
}
