//! Operator notifications.
//!
//! A bounded in-memory store of structured notifications. Every mutation is
//! announced on the bus so connected dashboards stay in sync.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::event_types::SOURCE_NOTIFICATION_CENTER;
use crate::bus::{Event, EventBus, EventType, Priority};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_EVICT_BATCH: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

impl NotificationLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    pub const fn priority(self) -> Priority {
        match self {
            Self::Critical => Priority::Critical,
            Self::Error => Priority::High,
            Self::Warning => Priority::Normal,
            Self::Info | Self::Success => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub id: String,
    pub label: String,
    /// Client-side action identifier, e.g. `restart_service`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub level: NotificationLevel,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub data: serde_json::Value,
    pub persistent: bool,
    pub auto_dismiss: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dismiss_after_ms: Option<u64>,
    pub actions: Vec<NotificationAction>,
    pub read: bool,
    /// Addressed notifications are only relayed to this principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Builder for [`NotificationCenter::create`].
#[derive(Debug, Clone)]
pub struct NewNotification {
    title: String,
    message: String,
    level: NotificationLevel,
    category: String,
    source: String,
    data: serde_json::Value,
    persistent: bool,
    auto_dismiss: Option<Duration>,
    actions: Vec<NotificationAction>,
    user_id: Option<String>,
}

impl NewNotification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            level: NotificationLevel::Info,
            category: "system".to_string(),
            source: SOURCE_NOTIFICATION_CENTER.to_string(),
            data: serde_json::Value::Null,
            persistent: false,
            auto_dismiss: None,
            actions: Vec::new(),
            user_id: None,
        }
    }

    pub fn level(mut self, level: NotificationLevel) -> Self {
        self.level = level;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn auto_dismiss(mut self, after: Duration) -> Self {
        self.auto_dismiss = Some(after);
        self
    }

    pub fn action(mut self, action: NotificationAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationQuery {
    pub level: Option<NotificationLevel>,
    pub category: Option<String>,
    pub unread_only: bool,
    /// Restrict to broadcast notifications plus those addressed to this user.
    pub user_id: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationStats {
    pub total: usize,
    pub unread: usize,
    pub persistent: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub capacity: usize,
    pub evict_batch: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            evict_batch: DEFAULT_EVICT_BATCH,
        }
    }
}

struct DismissTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct CenterInner {
    bus: Arc<EventBus>,
    config: NotificationConfig,
    /// Oldest first.
    store: Mutex<VecDeque<Notification>>,
    timers: Mutex<HashMap<String, DismissTimer>>,
}

#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<CenterInner>,
}

impl NotificationCenter {
    pub fn new(bus: Arc<EventBus>, config: NotificationConfig) -> Self {
        Self {
            inner: Arc::new(CenterInner {
                bus,
                config: NotificationConfig {
                    capacity: config.capacity.max(1),
                    evict_batch: config.evict_batch,
                },
                store: Mutex::new(VecDeque::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn create(&self, new: NewNotification) -> Notification {
        let auto_dismiss = new.auto_dismiss.filter(|_| !new.persistent);
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            message: new.message,
            level: new.level,
            category: new.category,
            timestamp: Utc::now(),
            source: new.source,
            data: new.data,
            persistent: new.persistent,
            auto_dismiss: auto_dismiss.is_some(),
            dismiss_after_ms: auto_dismiss.map(|d| d.as_millis() as u64),
            actions: new.actions,
            read: false,
            user_id: new.user_id,
        };

        let evicted = {
            let mut store = self.inner.store.lock().expect("notification store poisoned");
            store.push_back(notification.clone());
            self.inner.evict(&mut store, &notification.id)
        };
        for id in &evicted {
            self.inner.cancel_timer(id);
        }
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "evicted oldest notifications");
        }

        if let Some(after) = auto_dismiss {
            self.schedule_dismiss(&notification.id, after);
        }

        tracing::info!(
            id = %notification.id,
            level = notification.level.as_str(),
            category = %notification.category,
            "notification created"
        );
        let payload = serde_json::to_value(&notification).unwrap_or(serde_json::Value::Null);
        self.inner.emit(
            Event::new(EventType::Notification, SOURCE_NOTIFICATION_CENTER, payload)
                .with_priority(notification.level.priority())
                .with_correlation_id(notification.id.clone()),
        );
        notification
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.inner
            .store
            .lock()
            .expect("notification store poisoned")
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    /// Returns `false` when the notification does not exist. Marking an
    /// already-read notification succeeds without a second event.
    pub fn mark_as_read(&self, id: &str) -> bool {
        let updated = {
            let mut store = self.inner.store.lock().expect("notification store poisoned");
            let Some(notification) = store.iter_mut().find(|n| n.id == id) else {
                return false;
            };
            if notification.read {
                return true;
            }
            notification.read = true;
            notification.clone()
        };
        self.inner.emit(Event::new(
            EventType::NotificationUpdate,
            SOURCE_NOTIFICATION_CENTER,
            json!({
                "id": updated.id,
                "read": true,
                "user_id": updated.user_id,
                "notification": updated,
            }),
        ));
        true
    }

    /// Mark every unread notification as read. Returns how many changed.
    pub fn mark_all_as_read(&self) -> usize {
        let ids: Vec<String> = {
            let mut store = self.inner.store.lock().expect("notification store poisoned");
            store
                .iter_mut()
                .filter(|n| !n.read)
                .map(|n| {
                    n.read = true;
                    n.id.clone()
                })
                .collect()
        };
        if !ids.is_empty() {
            self.inner.emit(Event::new(
                EventType::NotificationUpdate,
                SOURCE_NOTIFICATION_CENTER,
                json!({ "ids": ids, "read": true, "all": true }),
            ));
        }
        ids.len()
    }

    pub fn dismiss(&self, id: &str) -> bool {
        self.inner.dismiss(id)
    }

    /// Remove every notification, persistent ones included.
    pub fn clear_all(&self) -> usize {
        let count = {
            let mut store = self.inner.store.lock().expect("notification store poisoned");
            let count = store.len();
            store.clear();
            count
        };
        let timers: Vec<DismissTimer> = self
            .inner
            .timers
            .lock()
            .expect("notification timers poisoned")
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        for timer in timers {
            timer.cancel.cancel();
        }
        self.inner.emit(Event::new(
            EventType::NotificationsCleared,
            SOURCE_NOTIFICATION_CENTER,
            json!({ "count": count }),
        ));
        count
    }

    /// Newest first, filtered then paginated.
    pub fn list(&self, query: &NotificationQuery) -> NotificationPage {
        let store = self.inner.store.lock().expect("notification store poisoned");
        let matching: Vec<&Notification> = store
            .iter()
            .rev()
            .filter(|n| query.level.map(|l| n.level == l).unwrap_or(true))
            .filter(|n| query.category.as_ref().map(|c| &n.category == c).unwrap_or(true))
            .filter(|n| !query.unread_only || !n.read)
            .filter(|n| match (&query.user_id, &n.user_id) {
                (Some(user), Some(owner)) => user == owner,
                _ => true,
            })
            .collect();

        let total = matching.len();
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let items: Vec<Notification> = matching
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect();
        NotificationPage {
            has_more: query.offset + items.len() < total,
            items,
            total,
            offset: query.offset,
            limit,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.inner
            .store
            .lock()
            .expect("notification store poisoned")
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    pub fn stats(&self) -> NotificationStats {
        let store = self.inner.store.lock().expect("notification store poisoned");
        let mut stats = NotificationStats {
            total: store.len(),
            ..NotificationStats::default()
        };
        for notification in store.iter() {
            if !notification.read {
                stats.unread += 1;
            }
            if notification.persistent {
                stats.persistent += 1;
            }
            *stats
                .by_level
                .entry(notification.level.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_category
                .entry(notification.category.clone())
                .or_default() += 1;
        }
        stats
    }

    /// Cancel pending auto-dismiss timers and wait for them.
    pub async fn stop(&self) {
        let timers: Vec<DismissTimer> = self
            .inner
            .timers
            .lock()
            .expect("notification timers poisoned")
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        for timer in timers {
            timer.cancel.cancel();
            let _ = timer.handle.await;
        }
    }

    fn schedule_dismiss(&self, id: &str, after: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id, "no runtime for auto-dismiss timer, notification stays");
            return;
        };
        let cancel = CancellationToken::new();
        let weak: Weak<CenterInner> = Arc::downgrade(&self.inner);
        let token = cancel.clone();
        let target = id.to_string();
        let handle = runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if let Some(inner) = weak.upgrade() {
                        tracing::debug!(id = %target, "auto-dismissing notification");
                        inner.dismiss(&target);
                    }
                }
            }
        });
        self.inner
            .timers
            .lock()
            .expect("notification timers poisoned")
            .insert(id.to_string(), DismissTimer { cancel, handle });
    }
}

impl CenterInner {
    fn emit(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Drop the oldest non-persistent entries once the non-persistent count
    /// exceeds capacity, at least `evict_batch` at a time. The entry just
    /// added is never chosen.
    fn evict(&self, store: &mut VecDeque<Notification>, newest: &str) -> Vec<String> {
        let transient = store.iter().filter(|n| !n.persistent).count();
        if transient <= self.config.capacity {
            return Vec::new();
        }
        let excess = transient - self.config.capacity;
        let mut remaining = excess.max(self.config.evict_batch);
        let mut evicted = Vec::new();
        store.retain(|n| {
            if remaining > 0 && !n.persistent && n.id != newest {
                remaining -= 1;
                evicted.push(n.id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    fn cancel_timer(&self, id: &str) {
        if let Some(timer) = self
            .timers
            .lock()
            .expect("notification timers poisoned")
            .remove(id)
        {
            timer.cancel.cancel();
        }
    }

    fn dismiss(&self, id: &str) -> bool {
        let removed = {
            let mut store = self.store.lock().expect("notification store poisoned");
            let Some(pos) = store.iter().position(|n| n.id == id) else {
                return false;
            };
            store.remove(pos)
        };
        self.cancel_timer(id);
        let user_id = removed.and_then(|n| n.user_id);
        self.emit(Event::new(
            EventType::NotificationDismissed,
            SOURCE_NOTIFICATION_CENTER,
            json!({ "id": id, "user_id": user_id }),
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::RecordingHandler;

    fn center(capacity: usize, evict_batch: usize) -> (Arc<EventBus>, NotificationCenter) {
        let bus = Arc::new(EventBus::default());
        let center = NotificationCenter::new(
            bus.clone(),
            NotificationConfig {
                capacity,
                evict_batch,
            },
        );
        (bus, center)
    }

    fn history_types(bus: &EventBus) -> Vec<EventType> {
        bus.history(None, None)
            .iter()
            .rev()
            .map(|e| e.event_type)
            .collect()
    }

    #[test]
    fn create_stores_and_announces() {
        let (bus, center) = center(10, 2);
        let created = center.create(
            NewNotification::new("Disk", "Disk almost full")
                .level(NotificationLevel::Critical)
                .category("storage")
                .data(json!({ "mount": "/" })),
        );

        assert_eq!(center.get(&created.id), Some(created.clone()));
        let history = bus.history(None, None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EventType::Notification);
        assert_eq!(history[0].priority, Priority::Critical);
        assert_eq!(history[0].payload["title"], "Disk");
        assert_eq!(history[0].payload["level"], "critical");
    }

    #[test]
    fn overflow_evicts_oldest_non_persistent_in_batches() {
        let (_bus, center) = center(5, 2);
        let pinned = center.create(NewNotification::new("pinned", "").persistent(true));
        let mut ids = Vec::new();
        for n in 0..6 {
            ids.push(center.create(NewNotification::new(format!("n{n}"), "")).id);
        }

        // Six transient entries over a capacity of five: evict a batch of two.
        let stats = center.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.persistent, 1);
        assert!(center.get(&pinned.id).is_some());
        assert!(center.get(&ids[0]).is_none());
        assert!(center.get(&ids[1]).is_none());
        assert!(center.get(&ids[5]).is_some());

        for n in 6..40 {
            center.create(NewNotification::new(format!("n{n}"), ""));
            let transient = center.stats().total - center.stats().persistent;
            assert!(transient <= 5);
        }
        assert!(center.get(&pinned.id).is_some());
    }

    #[test]
    fn read_dismiss_and_clear_emit_lifecycle_events() {
        let (bus, center) = center(10, 2);
        let a = center.create(NewNotification::new("a", ""));
        let b = center.create(NewNotification::new("b", ""));

        assert!(center.mark_as_read(&a.id));
        assert!(center.mark_as_read(&a.id));
        assert!(!center.mark_as_read("missing"));
        assert_eq!(center.unread_count(), 1);

        assert_eq!(center.mark_all_as_read(), 1);
        assert_eq!(center.mark_all_as_read(), 0);

        assert!(center.dismiss(&b.id));
        assert!(!center.dismiss(&b.id));
        assert_eq!(center.clear_all(), 1);

        assert_eq!(
            history_types(&bus),
            vec![
                EventType::Notification,
                EventType::Notification,
                EventType::NotificationUpdate,
                EventType::NotificationUpdate,
                EventType::NotificationDismissed,
                EventType::NotificationsCleared,
            ]
        );
    }

    #[test]
    fn list_filters_and_paginates_newest_first() {
        let (_bus, center) = center(100, 10);
        for n in 0..5 {
            let level = if n % 2 == 0 {
                NotificationLevel::Warning
            } else {
                NotificationLevel::Info
            };
            center.create(
                NewNotification::new(format!("n{n}"), "")
                    .level(level)
                    .category(if n < 3 { "deploy" } else { "health" }),
            );
        }
        let addressed = center.create(NewNotification::new("mine", "").user_id("alice"));
        center.mark_as_read(&addressed.id);

        let page = center.list(&NotificationQuery {
            limit: Some(2),
            ..NotificationQuery::default()
        });
        let titles: Vec<&str> = page.items.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["mine", "n4"]);
        assert_eq!(page.total, 6);
        assert!(page.has_more);

        let warnings = center.list(&NotificationQuery {
            level: Some(NotificationLevel::Warning),
            category: Some("deploy".into()),
            ..NotificationQuery::default()
        });
        let titles: Vec<&str> = warnings.items.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["n2", "n0"]);

        let unread_for_bob = center.list(&NotificationQuery {
            unread_only: true,
            user_id: Some("bob".into()),
            offset: 3,
            ..NotificationQuery::default()
        });
        assert_eq!(unread_for_bob.total, 5);
        assert_eq!(unread_for_bob.items.len(), 2);
        assert!(!unread_for_bob.has_more);

        let stats = center.stats();
        assert_eq!(stats.by_category.get("deploy"), Some(&3));
        assert_eq!(stats.by_level.get("warning"), Some(&3));
        assert_eq!(stats.unread, 5);
    }

    #[tokio::test]
    async fn auto_dismiss_fires_and_stop_cancels() {
        let (bus, center) = center(10, 2);
        let recorder = RecordingHandler::new("dismissals");
        bus.subscribe(EventType::NotificationDismissed, recorder.clone(), None, 0);
        bus.start();

        let quick = center.create(
            NewNotification::new("quick", "").auto_dismiss(Duration::from_millis(20)),
        );
        let slow = center.create(
            NewNotification::new("slow", "").auto_dismiss(Duration::from_secs(60)),
        );
        let pinned = center.create(
            NewNotification::new("pinned", "")
                .persistent(true)
                .auto_dismiss(Duration::from_millis(1)),
        );
        assert!(!pinned.auto_dismiss);

        let events = recorder.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(events[0].payload["id"], quick.id.as_str());
        assert!(center.get(&quick.id).is_none());

        center.stop().await;
        assert!(center.get(&slow.id).is_some());
        assert!(center.get(&pinned.id).is_some());
        bus.stop().await;
    }
}
