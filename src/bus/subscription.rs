use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event::{Event, EventType, Priority};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Receiver side of the bus. Implementations must not assume they are the
/// only subscriber and must return promptly; slow handlers are abandoned
/// after the bus handler timeout.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;

    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Adapter turning a plain closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

pub fn handler_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Optional narrowing applied to a subscription. Empty sets mean "any".
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Option<HashSet<EventType>>,
    pub sources: Option<HashSet<String>>,
    pub min_priority: Option<Priority>,
    pub max_age: Option<Duration>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    pub fn sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_priority(mut self, priority: Priority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    pub fn matches(&self, event: &Event, now: DateTime<Utc>) -> bool {
        if let Some(types) = &self.types {
            if !types.is_empty() && !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.is_empty() && !sources.contains(&event.source) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if event.priority < min {
                return false;
            }
        }
        if let Some(max_age) = self.max_age {
            let age = event.age_at(now).to_std().unwrap_or_default();
            if age > max_age {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(pub(crate) u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub struct Subscription {
    pub id: SubscriptionId,
    /// `None` for global subscriptions.
    pub event_type: Option<EventType>,
    pub handler: Arc<dyn EventHandler>,
    pub filter: Option<EventFilter>,
    pub priority: i32,
    pub registered_at: DateTime<Utc>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub id: SubscriptionId,
    pub handler: String,
    pub event_type: Option<EventType>,
    pub priority: i32,
    pub registered_at: DateTime<Utc>,
    pub delivered: u64,
    pub failed: u64,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        event_type: Option<EventType>,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
        priority: i32,
    ) -> Self {
        Self {
            id,
            event_type,
            handler,
            filter,
            priority,
            registered_at: Utc::now(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn accepts(&self, event: &Event, now: DateTime<Utc>) -> bool {
        self.filter
            .as_ref()
            .map(|filter| filter.matches(event, now))
            .unwrap_or(true)
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            id: self.id,
            handler: self.handler.name().to_string(),
            event_type: self.event_type,
            priority: self.priority,
            registered_at: self.registered_at,
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Type-scoped and global subscriptions, each list kept sorted by
/// descending priority (registration order breaks ties).
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_type: HashMap<EventType, Vec<Arc<Subscription>>>,
    global: Vec<Arc<Subscription>>,
}

impl SubscriptionTable {
    pub fn insert(&mut self, subscription: Arc<Subscription>) {
        let list = match subscription.event_type {
            Some(kind) => self.by_type.entry(kind).or_default(),
            None => &mut self.global,
        };
        let at = list.partition_point(|existing| existing.priority >= subscription.priority);
        list.insert(at, subscription);
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.len();
        self.global.retain(|sub| sub.id != id);
        for list in self.by_type.values_mut() {
            list.retain(|sub| sub.id != id);
        }
        self.by_type.retain(|_, list| !list.is_empty());
        self.len() != before
    }

    /// Type-scoped subscriptions first, then global ones.
    pub fn matching(&self, event_type: EventType) -> Vec<Arc<Subscription>> {
        let scoped = self.by_type.get(&event_type).map(Vec::as_slice).unwrap_or(&[]);
        scoped.iter().chain(self.global.iter()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.by_type.values().map(Vec::len).sum::<usize>()
    }

    pub fn stats(&self) -> Vec<SubscriptionStats> {
        self.by_type
            .values()
            .flatten()
            .chain(self.global.iter())
            .map(|sub| sub.stats())
            .collect()
    }
}
