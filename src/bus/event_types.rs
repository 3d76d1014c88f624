//! Channel names and event-to-channel routing.
//!
//! Single source of truth for which broadcast channel each event class is
//! relayed to.

use super::event::{Event, EventType};

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

pub const CHANNEL_SERVICE_UPDATES: &str = "service_updates";
pub const CHANNEL_SYSTEM_UPDATES: &str = "system_updates";
pub const CHANNEL_LOG_ENTRIES: &str = "log_entries";
pub const CHANNEL_NOTIFICATIONS: &str = "notifications";

pub const BUILTIN_CHANNELS: [&str; 4] = [
    CHANNEL_SERVICE_UPDATES,
    CHANNEL_SYSTEM_UPDATES,
    CHANNEL_LOG_ENTRIES,
    CHANNEL_NOTIFICATIONS,
];

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub const SOURCE_CONTAINER_WATCHER: &str = "container_watcher";
pub const SOURCE_METRICS_SAMPLER: &str = "metrics_sampler";
pub const SOURCE_NOTIFICATION_CENTER: &str = "notification_center";

const LOG_SOURCE_PREFIX: &str = "logs:";

/// Source tag for log lines of one container.
pub fn log_source(container_id: &str) -> String {
    format!("{LOG_SOURCE_PREFIX}{container_id}")
}

pub fn container_id_from_log_source(source: &str) -> Option<&str> {
    source
        .strip_prefix(LOG_SOURCE_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Per-container log channel, e.g. `log_entries:3f2a`.
pub fn container_log_channel(container_id: &str) -> String {
    format!("{CHANNEL_LOG_ENTRIES}:{container_id}")
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

pub fn channel_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::ServiceUpdate => CHANNEL_SERVICE_UPDATES,
        EventType::SystemMetrics => CHANNEL_SYSTEM_UPDATES,
        EventType::LogEntry => CHANNEL_LOG_ENTRIES,
        EventType::Notification
        | EventType::NotificationUpdate
        | EventType::NotificationDismissed
        | EventType::NotificationsCleared => CHANNEL_NOTIFICATIONS,
    }
}

/// Every channel an event should reach. Log entries also go to their
/// container's own channel.
pub fn channels_for(event: &Event) -> Vec<String> {
    let mut channels = vec![channel_for(event.event_type).to_string()];
    if event.event_type == EventType::LogEntry {
        if let Some(id) = container_id_from_log_source(&event.source) {
            channels.push(container_log_channel(id));
        }
    }
    channels
}
