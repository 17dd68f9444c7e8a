//! Ingestion pipeline: idempotent, backpressure-aware intake
//!
//! Producers submit [`WorkItem`]s through a [`PipelineHandle`]; a single
//! [`PipelineRunner`] task drains the queue and dispatches each item to
//! every registered handler in registration order. Admission applies
//! three gates in sequence: duplicate rejection, SLO headroom, then
//! queue capacity. A rejected item is dropped, never re-queued.
//!
//! The builder hands back the handle and the runner separately so the
//! caller owns task spawning:
//!
//! ```no_run
//! use intake_core::pipeline::Pipeline;
//!
//! # async fn example() {
//! let (handle, runner) = Pipeline::builder().build();
//! tokio::spawn(runner.run());
//! # }
//! ```

use crate::dedup::IdempotencySet;
use crate::error::HandlerError;
use crate::item::WorkItem;
use crate::slo::{SloConfig, SloGuard, SloSnapshot};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Pipeline tuning knobs
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded queue capacity between producers and the dispatch loop
    pub queue_capacity: usize,
    /// How long an identity key is remembered
    pub seen_window: Duration,
    /// How long the dispatch loop waits for an item before re-checking
    /// the running flag
    pub idle_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            seen_window: Duration::from_secs(72 * 3600),
            idle_wait: Duration::from_millis(500),
        }
    }
}

/// Consumer of dispatched work items
///
/// Handlers run inline on the dispatch loop, one at a time, in
/// registration order. A slow handler slows the whole pipeline; that is
/// the intended throttling behavior, not a defect to engineer around.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable name, used for logs, metrics, and removal
    fn name(&self) -> &str;

    /// Process one item; errors are counted and logged, not propagated
    async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError>;
}

/// Point-in-time pipeline counters
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub submitted: u64,
    pub duplicates: u64,
    pub backpressure_dropped: u64,
    pub queue_full_dropped: u64,
    pub processed: u64,
    pub handler_errors: u64,
    pub queue_depth: usize,
    pub seen_keys: usize,
    pub handlers: usize,
    pub slo: SloSnapshot,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    duplicates: AtomicU64,
    backpressure_dropped: AtomicU64,
    queue_full_dropped: AtomicU64,
    processed: AtomicU64,
    handler_errors: AtomicU64,
}

struct Shared {
    dedup: Arc<IdempotencySet>,
    slo: Arc<SloGuard>,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    counters: Counters,
    running: AtomicBool,
    queue_capacity: usize,
}

struct Enqueued {
    item: WorkItem,
    enqueued_at: Instant,
}

/// Builder for the pipeline
pub struct Pipeline {
    config: PipelineConfig,
    handlers: Vec<Arc<dyn Handler>>,
    slo: Option<Arc<SloGuard>>,
    dedup: Option<Arc<IdempotencySet>>,
}

impl Pipeline {
    pub fn builder() -> Self {
        Self {
            config: PipelineConfig::default(),
            handlers: Vec::new(),
            slo: None,
            dedup: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler; dispatch follows registration order
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Inject a shared SLO guard (e.g. one also visible to a stats server)
    pub fn slo_guard(mut self, slo: Arc<SloGuard>) -> Self {
        self.slo = Some(slo);
        self
    }

    /// Inject a shared idempotency set
    pub fn idempotency(mut self, dedup: Arc<IdempotencySet>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Split into a producer handle and the dispatch-loop runner
    pub fn build(self) -> (PipelineHandle, PipelineRunner) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let shared = Arc::new(Shared {
            dedup: self
                .dedup
                .unwrap_or_else(|| Arc::new(IdempotencySet::new(self.config.seen_window))),
            slo: self
                .slo
                .unwrap_or_else(|| Arc::new(SloGuard::new(SloConfig::default()))),
            handlers: RwLock::new(self.handlers),
            counters: Counters::default(),
            running: AtomicBool::new(true),
            queue_capacity: self.config.queue_capacity,
        });

        let handle = PipelineHandle {
            tx,
            shared: Arc::clone(&shared),
        };
        let runner = PipelineRunner {
            rx,
            shared,
            idle_wait: self.config.idle_wait,
        };
        (handle, runner)
    }
}

/// Producer-facing side of the pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Enqueued>,
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Submit one item for ingestion
    ///
    /// Returns `true` if the item was accepted and enqueued. Duplicates,
    /// headroom rejections, and queue overflow all return `false` and
    /// drop the item.
    pub fn submit(&self, item: WorkItem) -> bool {
        let counters = &self.shared.counters;
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        if !self.shared.running.load(Ordering::Relaxed) {
            tracing::debug!(key = %item.key, "submit after stop, dropping");
            return false;
        }

        if self.shared.dedup.contains(&item.key) {
            counters.duplicates.fetch_add(1, Ordering::Relaxed);
            crate::metrics::try_record_drop("duplicate");
            tracing::debug!(key = %item.key, source = %item.source, "duplicate item dropped");
            return false;
        }

        if !self.shared.slo.headroom() {
            counters.backpressure_dropped.fetch_add(1, Ordering::Relaxed);
            crate::metrics::try_record_drop("backpressure");
            tracing::warn!(key = %item.key, "no SLO headroom, item dropped");
            return false;
        }

        // Marked seen only once past both gates, so a rejected item can
        // be retried by its producer later.
        if !self.shared.dedup.mark_seen(&item.key) {
            counters.duplicates.fetch_add(1, Ordering::Relaxed);
            crate::metrics::try_record_drop("duplicate");
            return false;
        }

        crate::metrics::try_record_accepted(&item.source, &item.kind);
        let enqueued = Enqueued {
            item,
            enqueued_at: Instant::now(),
        };
        match self.tx.try_send(enqueued) {
            Ok(()) => {
                crate::metrics::try_set_queue_depth(self.queue_depth() as i64);
                true
            }
            Err(mpsc::error::TrySendError::Full(e)) => {
                // Not enqueued, so the key must stay resubmittable
                self.shared.dedup.forget(&e.item.key);
                counters.queue_full_dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::try_record_drop("queue_full");
                tracing::warn!(key = %e.item.key, "intake queue full, item dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(e)) => {
                self.shared.dedup.forget(&e.item.key);
                tracing::debug!(key = %e.item.key, "intake queue closed, item dropped");
                false
            }
        }
    }

    /// Submit a batch, returning how many items were accepted
    pub fn submit_batch(&self, items: Vec<WorkItem>) -> usize {
        items
            .into_iter()
            .map(|item| self.submit(item))
            .filter(|&accepted| accepted)
            .count()
    }

    /// Add a handler at runtime (appended after existing handlers)
    pub fn add_handler(&self, handler: Arc<dyn Handler>) {
        self.shared.handlers.write().push(handler);
    }

    /// Remove a handler by name; returns whether one was removed
    pub fn remove_handler(&self, name: &str) -> bool {
        let mut handlers = self.shared.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        handlers.len() < before
    }

    /// Signal the dispatch loop to stop after draining its current item
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        tracing::info!("pipeline stop requested");
    }

    /// Drop all remembered identity keys
    pub fn clear_seen(&self) {
        self.shared.dedup.clear();
    }

    fn queue_depth(&self) -> usize {
        self.shared.queue_capacity - self.tx.capacity()
    }

    /// Point-in-time counters
    pub fn stats(&self) -> PipelineStats {
        let counters = &self.shared.counters;
        PipelineStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            duplicates: counters.duplicates.load(Ordering::Relaxed),
            backpressure_dropped: counters.backpressure_dropped.load(Ordering::Relaxed),
            queue_full_dropped: counters.queue_full_dropped.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            handler_errors: counters.handler_errors.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            seen_keys: self.shared.dedup.len(),
            handlers: self.shared.handlers.read().len(),
            slo: self.shared.slo.snapshot(),
        }
    }
}

/// Owns the dispatch loop; consumed by `run()`
pub struct PipelineRunner {
    rx: mpsc::Receiver<Enqueued>,
    shared: Arc<Shared>,
    idle_wait: Duration,
}

impl PipelineRunner {
    /// Drain the queue until stopped or all handles are dropped
    pub async fn run(mut self) {
        tracing::info!("pipeline dispatch loop started");

        while self.shared.running.load(Ordering::Relaxed) {
            match tokio::time::timeout(self.idle_wait, self.rx.recv()).await {
                Ok(Some(enqueued)) => self.dispatch(enqueued).await,
                Ok(None) => break,
                // Idle: loop back to observe the running flag
                Err(_) => continue,
            }
        }

        tracing::info!(
            processed = self.shared.counters.processed.load(Ordering::Relaxed),
            "pipeline dispatch loop stopped"
        );
    }

    async fn dispatch(&self, enqueued: Enqueued) {
        let item = enqueued.item;
        let handlers: Vec<Arc<dyn Handler>> = self.shared.handlers.read().clone();

        for handler in &handlers {
            if let Err(err) = handler.handle(&item).await {
                self.shared
                    .counters
                    .handler_errors
                    .fetch_add(1, Ordering::Relaxed);
                crate::metrics::try_record_handler_error(handler.name());
                tracing::warn!(
                    handler = handler.name(),
                    key = %item.key,
                    error = %err,
                    "handler failed"
                );
            }
        }

        // Latency covers queue residency plus all handler work
        let latency = enqueued.enqueued_at.elapsed().as_secs_f64();
        self.shared.slo.record_latency(latency);
        self.shared.slo.record_processed(1);
        self.shared.counters.processed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::try_observe_dispatch_latency(latency);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Handler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError> {
            self.seen.lock().push(item.key.clone());
            if self.fail {
                return Err(HandlerError::from("synthetic failure"));
            }
            Ok(())
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            idle_wait: Duration::from_millis(10),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_submit_and_dispatch() {
        let recorder = Recorder::new("rec");
        let (handle, runner) = Pipeline::builder()
            .config(fast_config())
            .handler(recorder.clone())
            .build();
        let task = tokio::spawn(runner.run());

        assert!(handle.submit(WorkItem::new("src", "evt", Bytes::from("a"))));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(recorder.seen.lock().len(), 1);
        assert_eq!(handle.stats().processed, 1);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicates_rejected() {
        let recorder = Recorder::new("rec");
        let (handle, runner) = Pipeline::builder()
            .config(fast_config())
            .handler(recorder.clone())
            .build();
        tokio::spawn(runner.run());

        let item = WorkItem::new("src", "evt", Bytes::from("same"));
        assert!(handle.submit(item.clone()));
        assert!(!handle.submit(item.clone()));
        assert!(!handle.submit(item));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.seen.lock().len(), 1);

        let stats = handle.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.duplicates, 2);
        handle.stop();
    }

    #[tokio::test]
    async fn test_fifo_dispatch_order() {
        let recorder = Recorder::new("rec");
        let (handle, runner) = Pipeline::builder()
            .config(fast_config())
            .handler(recorder.clone())
            .build();
        tokio::spawn(runner.run());

        for i in 0..20 {
            let item = WorkItem::with_key(format!("k-{i:02}"), "src", "evt", Bytes::new());
            assert!(handle.submit(item));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = recorder.seen.lock();
        let expected: Vec<String> = (0..20).map(|i| format!("k-{i:02}")).collect();
        assert_eq!(*seen, expected);
        handle.stop();
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        struct Ordered {
            name: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl Handler for Ordered {
            fn name(&self) -> &str {
                self.name
            }
            async fn handle(&self, _item: &WorkItem) -> Result<(), HandlerError> {
                self.order.lock().push(self.name);
                Ok(())
            }
        }

        let (handle, runner) = Pipeline::builder()
            .config(fast_config())
            .handler(Arc::new(Ordered {
                name: "a",
                order: order.clone(),
            }))
            .handler(Arc::new(Ordered {
                name: "b",
                order: order.clone(),
            }))
            .build();
        tokio::spawn(runner.run());

        handle.submit(WorkItem::new("src", "evt", Bytes::from("x")));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock(), vec!["a", "b"]);
        handle.stop();
    }

    #[tokio::test]
    async fn test_handler_error_counted_not_fatal() {
        let failing = Recorder::failing("bad");
        let after = Recorder::new("good");
        let (handle, runner) = Pipeline::builder()
            .config(fast_config())
            .handler(failing.clone())
            .handler(after.clone())
            .build();
        tokio::spawn(runner.run());

        handle.submit(WorkItem::new("src", "evt", Bytes::from("x")));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Later handlers still run, item still counts as processed
        assert_eq!(after.seen.lock().len(), 1);
        let stats = handle.stats();
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.processed, 1);
        handle.stop();
    }

    #[tokio::test]
    async fn test_backpressure_rejection_keeps_key_fresh() {
        let slo = Arc::new(SloGuard::new(crate::slo::SloConfig {
            max_throughput_per_min: 10,
            ..Default::default()
        }));
        let (handle, runner) = Pipeline::builder()
            .config(fast_config())
            .slo_guard(slo.clone())
            .build();
        tokio::spawn(runner.run());

        // Exhaust throughput headroom directly
        slo.record_processed(8);

        let item = WorkItem::new("src", "evt", Bytes::from("later"));
        assert!(!handle.submit(item.clone()));
        assert_eq!(handle.stats().backpressure_dropped, 1);

        // Key was not burned: the same item is admissible once headroom
        // returns (simulated here by a fresh guard minute via clear)
        assert!(!handle.shared.dedup.contains(&item.key));
        handle.stop();
    }

    #[tokio::test]
    async fn test_submit_batch() {
        let (handle, runner) = Pipeline::builder().config(fast_config()).build();
        tokio::spawn(runner.run());

        let items = vec![
            WorkItem::new("src", "evt", Bytes::from("1")),
            WorkItem::new("src", "evt", Bytes::from("2")),
            WorkItem::new("src", "evt", Bytes::from("1")),
        ];
        assert_eq!(handle.submit_batch(items), 2);
        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_rejects_new_submissions() {
        let (handle, runner) = Pipeline::builder().config(fast_config()).build();
        let task = tokio::spawn(runner.run());

        handle.stop();
        assert!(!handle.submit(WorkItem::new("src", "evt", Bytes::from("x"))));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_does_not_burn_key() {
        let config = PipelineConfig {
            queue_capacity: 1,
            ..fast_config()
        };
        // Runner not yet spawned: nothing drains the queue
        let (handle, runner) = Pipeline::builder().config(config).build();

        assert!(handle.submit(WorkItem::with_key("first", "src", "evt", Bytes::new())));
        let dropped = WorkItem::with_key("second", "src", "evt", Bytes::new());
        assert!(!handle.submit(dropped.clone()));
        assert_eq!(handle.stats().queue_full_dropped, 1);

        // The overflow drop is not a duplicate and the key is not held
        assert!(!handle.shared.dedup.contains(&dropped.key));
        assert!(!handle.submit(dropped.clone()));
        assert_eq!(handle.stats().duplicates, 0);
        assert_eq!(handle.stats().queue_full_dropped, 2);

        // Once the queue drains, the same item is accepted
        tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.submit(dropped));
        handle.stop();
    }

    #[tokio::test]
    async fn test_clear_seen_readmits() {
        let (handle, runner) = Pipeline::builder().config(fast_config()).build();
        tokio::spawn(runner.run());

        let item = WorkItem::new("src", "evt", Bytes::from("x"));
        assert!(handle.submit(item.clone()));
        assert!(!handle.submit(item.clone()));
        handle.clear_seen();
        assert!(handle.submit(item));
        handle.stop();
    }

    #[tokio::test]
    async fn test_runtime_handler_add_remove() {
        let recorder = Recorder::new("late");
        let (handle, runner) = Pipeline::builder().config(fast_config()).build();
        tokio::spawn(runner.run());

        handle.add_handler(recorder.clone());
        assert_eq!(handle.stats().handlers, 1);
        handle.submit(WorkItem::new("src", "evt", Bytes::from("x")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.seen.lock().len(), 1);

        assert!(handle.remove_handler("late"));
        assert!(!handle.remove_handler("late"));
        assert_eq!(handle.stats().handlers, 0);
        handle.stop();
    }
}
