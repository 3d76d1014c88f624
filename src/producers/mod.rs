//! Event producers.
//!
//! Each producer owns its background task and publishes into the shared
//! [`EventBus`](crate::bus::EventBus); none of them knows who is listening.

pub mod container_watcher;
pub mod log_tailer;
pub mod metrics;
pub mod notifications;

pub use container_watcher::{ContainerEventWatcher, ContainerResourceSnapshot};
pub use log_tailer::{LogLevel, LogTailer, ParsedLine};
pub use metrics::{ChangeGate, HostProbe, HostSample, MetricsConfig, MetricsSampler, SysinfoProbe};
pub use notifications::{
    NewNotification, Notification, NotificationAction, NotificationCenter, NotificationConfig,
    NotificationLevel, NotificationPage, NotificationQuery, NotificationStats,
};
