use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event::{Event, EventType, Priority};
use super::lanes::LaneQueue;
use super::subscription::{
    EventFilter, EventHandler, Subscription, SubscriptionId, SubscriptionStats, SubscriptionTable,
};

const DEFAULT_LANE_CAPACITY: usize = 1000;
const DEFAULT_HISTORY_SIZE: usize = 1000;
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_BASE_DELAY: Duration = Duration::from_millis(50);
const RESTART_MAX_DELAY: Duration = Duration::from_secs(2);
/// Consecutive quick crashes tolerated before the supervisor gives up.
const MAX_RESTARTS: u32 = 5;
/// A loop that survived this long resets the crash streak.
const STABLE_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub lane_capacity: usize,
    pub history_size: usize,
    pub handler_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lane_capacity: DEFAULT_LANE_CAPACITY,
            history_size: DEFAULT_HISTORY_SIZE,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    handler_timeouts: AtomicU64,
    handler_dropped: AtomicU64,
    restarts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub running: bool,
    pub published: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    /// Deliveries skipped because a subscriber's own queue was full.
    pub handler_dropped: u64,
    pub dispatcher_restarts: u64,
    pub queued: LaneDepths,
    pub history_len: usize,
    pub subscriptions: usize,
}

struct BusInner {
    lanes: LaneQueue,
    subscriptions: RwLock<SubscriptionTable>,
    mailboxes: Mutex<HashMap<SubscriptionId, Mailbox>>,
    mailbox_capacity: usize,
    history: Mutex<VecDeque<Arc<Event>>>,
    history_size: usize,
    handler_timeout: Duration,
    next_subscription: AtomicU64,
    counters: Arc<BusCounters>,
    /// Panics the dispatch loop raises on its next pops.
    #[cfg(test)]
    injected_panics: AtomicUsize,
}

/// Queue feeding one subscription's worker. Each subscription is drained by
/// its own task, so a slow handler only delays itself.
struct Mailbox {
    tx: mpsc::Sender<Arc<Event>>,
    worker: JoinHandle<()>,
}

struct Dispatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Priority-laned asynchronous dispatcher.
///
/// `publish` never blocks: the event is queued in its priority lane (or
/// dropped and counted when that lane is full). A single dispatch loop,
/// started with [`EventBus::start`], drains lanes strictly by priority and
/// hands each event to the matching subscriptions (type-scoped first, then
/// global) through per-subscription queues. Every subscription keeps FIFO
/// order; no subscription waits on another.
pub struct EventBus {
    inner: Arc<BusInner>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

/// Returned by `subscribe`; dropping it keeps the subscription alive.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns `false` if the subscription (or the bus) is already gone.
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.unsubscribe(self.id),
            None => false,
        }
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                lanes: LaneQueue::new(config.lane_capacity),
                subscriptions: RwLock::new(SubscriptionTable::default()),
                mailboxes: Mutex::new(HashMap::new()),
                mailbox_capacity: config.lane_capacity.max(1),
                history: Mutex::new(VecDeque::with_capacity(config.history_size.min(4096))),
                history_size: config.history_size,
                handler_timeout: config.handler_timeout,
                next_subscription: AtomicU64::new(1),
                counters: Arc::new(BusCounters::default()),
                #[cfg(test)]
                injected_panics: AtomicUsize::new(0),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Queue an event for asynchronous dispatch. Returns `false` when the
    /// event's lane is full and the event was dropped.
    pub fn publish(&self, event: Event) -> bool {
        let event = Arc::new(event);
        if !self.inner.lanes.push(event.clone()) {
            let dropped = self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                event_type = %event.event_type,
                priority = %event.priority,
                dropped,
                "event lane full, dropping event"
            );
            return false;
        }
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.record_history(event);
        true
    }

    /// Run matching handlers inline and in priority order, bypassing the
    /// lanes. Returns the number of handlers invoked.
    pub async fn publish_sync(&self, event: Event) -> usize {
        let event = Arc::new(event);
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.record_history(event.clone());
        self.inner.dispatch_inline(&event).await
    }

    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
        priority: i32,
    ) -> SubscriptionHandle {
        self.register(Some(event_type), handler, filter, priority)
    }

    pub fn subscribe_global(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
        priority: i32,
    ) -> SubscriptionHandle {
        self.register(None, handler, filter, priority)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    fn register(
        &self,
        event_type: Option<EventType>,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
        priority: i32,
    ) -> SubscriptionHandle {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            subscription = %id,
            handler = handler.name(),
            event_type = ?event_type,
            priority,
            "registering subscription"
        );
        let subscription = Arc::new(Subscription::new(id, event_type, handler, filter, priority));
        write(&self.inner.subscriptions).insert(subscription);
        SubscriptionHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Most-recent-first slice of the bounded history.
    pub fn history(&self, limit: Option<usize>, filter: Option<&EventFilter>) -> Vec<Arc<Event>> {
        let now = Utc::now();
        let history = lock(&self.inner.history);
        history
            .iter()
            .rev()
            .filter(|event| filter.map(|f| f.matches(event, now)).unwrap_or(true))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn subscription_stats(&self) -> Vec<SubscriptionStats> {
        read(&self.inner.subscriptions).stats()
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        let depths = self.inner.lanes.depths();
        BusStats {
            running: self.is_running(),
            published: counters.published.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            handler_timeouts: counters.handler_timeouts.load(Ordering::Relaxed),
            handler_dropped: counters.handler_dropped.load(Ordering::Relaxed),
            dispatcher_restarts: counters.restarts.load(Ordering::Relaxed),
            queued: LaneDepths {
                critical: depths[Priority::Critical.lane()],
                high: depths[Priority::High.lane()],
                normal: depths[Priority::Normal.lane()],
                low: depths[Priority::Low.lane()],
            },
            history_len: lock(&self.inner.history).len(),
            subscriptions: read(&self.inner.subscriptions).len(),
        }
    }

    /// Spawn the dispatch loop. No-op if it is already running.
    pub fn start(&self) {
        let mut guard = lock(&self.dispatcher);
        if guard.as_ref().map(|d| !d.handle.is_finished()).unwrap_or(false) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = spawn_supervised(self.inner.clone(), cancel.clone());
        *guard = Some(Dispatcher { cancel, handle });
        tracing::info!("event bus dispatcher started");
    }

    /// Cancel the dispatch loop, let it drain queued events, then wait for
    /// every subscription worker to finish what it was handed.
    pub async fn stop(&self) {
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel.cancel();
            if let Err(e) = dispatcher.handle.await {
                tracing::warn!("event bus dispatcher ended abnormally: {e}");
            }
        }
        self.inner.close_mailboxes().await;
        tracing::info!("event bus dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.dispatcher)
            .as_ref()
            .map(|d| !d.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl BusInner {
    fn record_history(&self, event: Arc<Event>) {
        if self.history_size == 0 {
            return;
        }
        let mut history = lock(&self.history);
        while history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(event);
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = write(&self.subscriptions).remove(id);
        // Dropping the sender lets the worker finish what it already holds.
        lock(&self.mailboxes).remove(&id);
        if removed {
            tracing::debug!(subscription = %id, "subscription removed");
        }
        removed
    }

    /// Hand `event` to every accepting subscription's queue, in priority
    /// order. Returns the number of subscriptions it was queued for.
    fn dispatch(&self, event: &Arc<Event>) -> usize {
        // The read guard stays held so an unsubscribe cannot race a new mailbox.
        let subscriptions = read(&self.subscriptions);
        let targets = subscriptions.matching(event.event_type);
        let now = Utc::now();
        let mut mailboxes = lock(&self.mailboxes);
        let mut queued = 0;
        for subscription in targets {
            if !subscription.accepts(event, now) {
                continue;
            }
            let mailbox = mailboxes
                .entry(subscription.id)
                .or_insert_with(|| self.open_mailbox(subscription.clone()));
            match mailbox.tx.try_send(event.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscription.record_failed();
                    self.counters.handler_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        handler = subscription.handler.name(),
                        event_type = %event.event_type,
                        capacity = self.mailbox_capacity,
                        "subscriber queue full, event skipped for this handler"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscription = %subscription.id, "subscriber worker gone");
                }
            }
        }
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        queued
    }

    async fn dispatch_inline(&self, event: &Arc<Event>) -> usize {
        let targets = read(&self.subscriptions).matching(event.event_type);
        let now = Utc::now();
        let mut invoked = 0;
        for subscription in targets {
            if !subscription.accepts(event, now) {
                continue;
            }
            invoked += 1;
            invoke(&subscription, event, self.handler_timeout, &self.counters).await;
        }
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        invoked
    }

    fn open_mailbox(&self, subscription: Arc<Subscription>) -> Mailbox {
        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(self.mailbox_capacity);
        let timeout = self.handler_timeout;
        let counters = self.counters.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                invoke(&subscription, &event, timeout, &counters).await;
            }
        });
        Mailbox { tx, worker }
    }

    /// Close every subscriber queue and wait for the workers to drain them.
    async fn close_mailboxes(&self) {
        let mailboxes: Vec<Mailbox> = lock(&self.mailboxes).drain().map(|(_, m)| m).collect();
        for Mailbox { tx, worker } in mailboxes {
            drop(tx);
            if let Err(e) = worker.await {
                tracing::warn!("subscriber worker ended abnormally: {e}");
            }
        }
    }

    #[cfg(test)]
    fn take_injected_panic(&self) -> bool {
        self.injected_panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn invoke(subscription: &Subscription, event: &Event, timeout: Duration, counters: &BusCounters) {
    let call = AssertUnwindSafe(subscription.handler.handle(event)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(()))) => subscription.record_delivered(),
        Ok(Ok(Err(e))) => {
            subscription.record_failed();
            counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                handler = subscription.handler.name(),
                event_type = %event.event_type,
                event_id = %event.id,
                "event handler failed: {e}"
            );
        }
        Ok(Err(_panic)) => {
            subscription.record_failed();
            counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                handler = subscription.handler.name(),
                event_type = %event.event_type,
                event_id = %event.id,
                "event handler panicked"
            );
        }
        Err(_) => {
            subscription.record_failed();
            counters.handler_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                handler = subscription.handler.name(),
                event_type = %event.event_type,
                timeout_ms = timeout.as_millis() as u64,
                "event handler timed out"
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

fn restart_delay(attempt: u32) -> Duration {
    RESTART_BASE_DELAY
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        .min(RESTART_MAX_DELAY)
}

/// Runs the dispatch loop under a supervisor that restarts it with
/// exponential backoff if it dies from anything other than cancellation.
/// After [`MAX_RESTARTS`] quick crashes in a row the bus stops dispatching.
fn spawn_supervised(inner: Arc<BusInner>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut streak = 0u32;
        loop {
            let started = tokio::time::Instant::now();
            let worker = tokio::spawn(dispatch_loop(inner.clone(), cancel.clone()));
            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_panic() && !cancel.is_cancelled() => {
                    if started.elapsed() >= STABLE_AFTER {
                        streak = 0;
                    }
                    if streak >= MAX_RESTARTS {
                        tracing::error!(
                            restarts = streak,
                            "event dispatcher keeps panicking, giving up"
                        );
                        break;
                    }
                    streak += 1;
                    inner.counters.restarts.fetch_add(1, Ordering::Relaxed);
                    let delay = restart_delay(streak);
                    tracing::error!(
                        attempt = streak,
                        delay_ms = delay.as_millis() as u64,
                        "event dispatcher panicked, restarting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("event dispatcher aborted: {e}");
                    break;
                }
            }
        }
    })
}

async fn dispatch_loop(inner: Arc<BusInner>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = inner.lanes.pop() => event,
        };
        #[cfg(test)]
        if inner.take_injected_panic() {
            panic!("injected dispatcher fault");
        }
        tracing::trace!(event_type = %event.event_type, priority = %event.priority, "dispatching");
        inner.dispatch(&event);
    }

    // Drain whatever was accepted before cancellation.
    while let Some(event) = inner.lanes.try_pop() {
        inner.dispatch(&event);
    }
}
