use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use ensemble_core::events::{Event, EventKind, EventType};
use ensemble_core::ids::{EventId, SubscriptionId};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct BusConfig {
    /// How long `stop()` waits for in-flight async handlers before dropping them.
    pub drain_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Delivery priority. Higher priorities are delivered first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Which events a subscription receives.
#[derive(Clone, Debug)]
pub enum EventFilter {
    All,
    Types(HashSet<EventType>),
}

impl EventFilter {
    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self::Types(types.into_iter().collect())
    }

    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Self::All => true,
            Self::Types(types) => types.contains(&event_type),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Runs inline inside `publish`. Must be fast: it blocks the publisher.
pub trait SyncEventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Runs on the tokio runtime after `publish` has returned.
#[async_trait]
pub trait AsyncEventHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

#[derive(Clone)]
pub enum EventHandler {
    Sync(Arc<dyn SyncEventHandler>),
    Async(Arc<dyn AsyncEventHandler>),
}

impl EventHandler {
    /// Wrap a closure as a synchronous handler.
    pub fn sync_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(FnHandler {
            name: name.into(),
            f,
        }))
    }
}

struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> SyncEventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event)
    }
}

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
    priority: EventPriority,
    seq: u64,
}

/// Snapshot of bus counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BusStats {
    pub total_published: u64,
    /// Handler invocations that ran to an outcome, successful or not.
    pub total_processed: u64,
    pub total_failed: u64,
    /// Async handler invocations skipped because the bus was stopped or draining timed out.
    pub dropped_async: u64,
    pub active_subscriptions: usize,
    pub avg_processing_time_ms: f64,
    pub per_type_counts: BTreeMap<EventType, u64>,
}

#[derive(Default)]
struct Counters {
    published: u64,
    processed: u64,
    failed: u64,
    dropped_async: u64,
    processing_time: Duration,
    per_type: BTreeMap<EventType, u64>,
}

struct BusInner {
    config: BusConfig,
    subscriptions: RwLock<Vec<Subscription>>,
    next_seq: AtomicU64,
    counters: Mutex<Counters>,
    running: AtomicBool,
    tracker: TaskTracker,
    cancel: Mutex<CancellationToken>,
}

/// In-process publish/subscribe hub.
///
/// Handlers are delivered in priority order (highest first, subscription order
/// within a priority). Synchronous handlers run before `publish` returns.
/// Asynchronous handlers for one publish run as a single background job, one
/// after another in the same order. A failing or panicking handler is counted
/// and logged and never stops delivery to the rest.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a stopped bus. Call [`EventBus::start`] before relying on async handlers.
    pub fn new(config: BusConfig) -> Self {
        let tracker = TaskTracker::new();
        tracker.close();
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: RwLock::new(Vec::new()),
                next_seq: AtomicU64::new(0),
                counters: Mutex::new(Counters::default()),
                running: AtomicBool::new(false),
                tracker,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn start(&self) {
        {
            let mut cancel = self.inner.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
        self.inner.tracker.reopen();
        self.inner.running.store(true, Ordering::SeqCst);
        info!("event bus started");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop accepting async work and drain what is in flight, up to the
    /// configured timeout. Returns the number of background jobs cut short.
    pub async fn stop(&self) -> usize {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return 0;
        }
        self.inner.tracker.close();

        let timeout = self.inner.config.drain_timeout;
        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok()
        {
            info!("event bus stopped, all async handlers drained");
            return 0;
        }

        let pending = self.inner.tracker.len();
        warn!(
            pending,
            timeout_ms = timeout.as_millis() as u64,
            "event bus drain timed out, dropping pending async handlers"
        );
        self.inner.cancel.lock().cancel();
        self.inner.tracker.wait().await;
        pending
    }

    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: EventHandler,
        priority: EventPriority,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.inner.subscriptions.write();
        subs.push(Subscription {
            id: id.clone(),
            filter,
            handler,
            priority,
            seq,
        });
        subs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        debug!(subscription_id = %id, ?priority, "subscribed");
        id
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| &s.id != id);
        subs.len() != before
    }

    /// Stamp and deliver an event. Never fails; handler failures are counted.
    pub fn publish(
        &self,
        kind: EventKind,
        source: &str,
        correlation_id: Option<String>,
        tags: Vec<String>,
    ) -> EventId {
        let event = Arc::new(Event {
            id: EventId::new(),
            kind,
            source: source.to_string(),
            correlation_id,
            timestamp: Utc::now(),
            tags,
        });
        let event_type = event.event_type();

        {
            let mut counters = self.inner.counters.lock();
            counters.published += 1;
            *counters.per_type.entry(event_type).or_insert(0) += 1;
        }

        let (sync_handlers, async_handlers) = self.matching_handlers(event_type);

        for handler in &sync_handlers {
            let start = Instant::now();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
            self.inner
                .record_outcome(handler.name(), event_type, outcome, start.elapsed());
        }

        if !async_handlers.is_empty() {
            self.schedule_async(event.clone(), async_handlers);
        }

        event.id.clone()
    }

    pub fn stats(&self) -> BusStats {
        let active_subscriptions = self.inner.subscriptions.read().len();
        let counters = self.inner.counters.lock();
        let avg_processing_time_ms = if counters.processed == 0 {
            0.0
        } else {
            counters.processing_time.as_secs_f64() * 1000.0 / counters.processed as f64
        };
        BusStats {
            total_published: counters.published,
            total_processed: counters.processed,
            total_failed: counters.failed,
            dropped_async: counters.dropped_async,
            active_subscriptions,
            avg_processing_time_ms,
            per_type_counts: counters.per_type.clone(),
        }
    }

    fn matching_handlers(
        &self,
        event_type: EventType,
    ) -> (Vec<Arc<dyn SyncEventHandler>>, Vec<Arc<dyn AsyncEventHandler>>) {
        let subs = self.inner.subscriptions.read();
        let mut sync_handlers = Vec::new();
        let mut async_handlers = Vec::new();
        for sub in subs.iter().filter(|s| s.filter.matches(event_type)) {
            match &sub.handler {
                EventHandler::Sync(h) => sync_handlers.push(Arc::clone(h)),
                EventHandler::Async(h) => async_handlers.push(Arc::clone(h)),
            }
        }
        (sync_handlers, async_handlers)
    }

    fn schedule_async(&self, event: Arc<Event>, handlers: Vec<Arc<dyn AsyncEventHandler>>) {
        let count = handlers.len() as u64;
        let runtime = tokio::runtime::Handle::try_current();
        let (true, Ok(runtime)) = (self.is_running(), runtime) else {
            warn!(
                event_type = %event.event_type(),
                count,
                "event bus not running, async handlers dropped"
            );
            self.inner.counters.lock().dropped_async += count;
            return;
        };

        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.lock().clone();
        let _ = self
            .inner
            .tracker
            .spawn_on(run_async_handlers(inner, event, handlers, cancel), &runtime);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

async fn run_async_handlers(
    inner: Arc<BusInner>,
    event: Arc<Event>,
    handlers: Vec<Arc<dyn AsyncEventHandler>>,
    cancel: CancellationToken,
) {
    let event_type = event.event_type();
    let total = handlers.len();
    for (i, handler) in handlers.iter().enumerate() {
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = AssertUnwindSafe(handler.handle(&event)).catch_unwind() => Some(r),
        };
        match outcome {
            Some(outcome) => inner.record_outcome(handler.name(), event_type, outcome, start.elapsed()),
            None => {
                inner.counters.lock().dropped_async += (total - i) as u64;
                return;
            }
        }
    }
}

impl BusInner {
    fn record_outcome(
        &self,
        handler: &str,
        event_type: EventType,
        outcome: Result<Result<(), HandlerError>, Box<dyn Any + Send>>,
        elapsed: Duration,
    ) {
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!(handler, event_type = %event_type, error = %e, "event handler failed");
                true
            }
            Err(panic) => {
                error!(
                    handler,
                    event_type = %event_type,
                    panic = %panic_message(&panic),
                    "event handler panicked"
                );
                true
            }
        };
        let mut counters = self.counters.lock();
        counters.processed += 1;
        counters.processing_time += elapsed;
        if failed {
            counters.failed += 1;
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
