use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch lane of an event. Higher lanes are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Lanes in drain order.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub const fn lane(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of event classes carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ServiceUpdate,
    SystemMetrics,
    LogEntry,
    Notification,
    NotificationUpdate,
    NotificationDismissed,
    NotificationsCleared,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceUpdate => "service_update",
            Self::SystemMetrics => "system_metrics",
            Self::LogEntry => "log_entry",
            Self::Notification => "notification",
            Self::NotificationUpdate => "notification_update",
            Self::NotificationDismissed => "notification_dismissed",
            Self::NotificationsCleared => "notifications_cleared",
        }
    }

    pub const fn all() -> &'static [EventType] {
        &[
            EventType::ServiceUpdate,
            EventType::SystemMetrics,
            EventType::LogEntry,
            EventType::Notification,
            EventType::NotificationUpdate,
            EventType::NotificationDismissed,
            EventType::NotificationsCleared,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| format!("unknown event type: {value}"))
    }
}

/// Immutable envelope shared by every producer and consumer.
///
/// Events are wrapped in an `Arc` once published, so the fields are only ever
/// read after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            priority: Priority::Normal,
            payload,
            source: source.into(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }
}
