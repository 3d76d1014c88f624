//! Container lifecycle producer.
//!
//! Tails the runtime event stream and turns every lifecycle action into a
//! `service_update` event carrying the container's descriptor and a resource
//! snapshot. A container that disappeared before it could be inspected is
//! reported with status `removed`; one the runtime failed to describe for any
//! other reason is reported as `unknown`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::event_types::SOURCE_CONTAINER_WATCHER;
use crate::bus::{Event, EventBus, EventType, Priority};
use crate::docker::{
    ContainerDetails, ContainerRuntime, CpuCounters, RuntimeError, RuntimeEvent, StatsSample,
};

use super::log_tailer::LogTailer;

pub const WATCHED_ACTIONS: [&str; 11] = [
    "start",
    "stop",
    "restart",
    "kill",
    "die",
    "pause",
    "unpause",
    "create",
    "destroy",
    "update",
    "health_status",
];

const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const REDACTED: &str = "***";
const SENSITIVE_MARKERS: [&str; 4] = ["PASSWORD", "SECRET", "KEY", "TOKEN"];
const SERVICE_ID_LABEL: &str = "fleet.service_id";
const STATUS_REMOVED: &str = "removed";
const STATUS_UNKNOWN: &str = "unknown";

/// CPU and memory usage derived from two consecutive counter reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ContainerResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
}

impl ContainerResourceSnapshot {
    pub fn from_sample(sample: &StatsSample) -> Self {
        Self {
            cpu_percent: round2(cpu_percent(&sample.cpu, &sample.precpu)),
            memory_percent: round2(memory_percent(sample.memory_usage, sample.memory_limit)),
            memory_usage: sample.memory_usage,
            memory_limit: sample.memory_limit,
            network_rx: sample.rx_bytes,
            network_tx: sample.tx_bytes,
        }
    }
}

/// `(cpu_delta / system_delta) * cpus * 100`, zero when either delta is not
/// positive.
pub fn cpu_percent(current: &CpuCounters, previous: &CpuCounters) -> f64 {
    let cpu_delta = current.total_usage as f64 - previous.total_usage as f64;
    let system_delta = current.system_usage as f64 - previous.system_usage as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    let cpus = current.online_cpus.max(1) as f64;
    (cpu_delta / system_delta) * cpus * 100.0
}

pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Split `health_status: healthy` into the action and its detail.
pub fn normalize_action(action: &str) -> (String, Option<String>) {
    match action.split_once(':') {
        Some((head, detail)) => {
            let detail = detail.trim();
            (
                head.trim().to_string(),
                (!detail.is_empty()).then(|| detail.to_string()),
            )
        }
        None => (action.trim().to_string(), None),
    }
}

/// `KEY=VALUE` pairs to a map, masking values whose key looks sensitive.
pub fn redact_env(env: &[String]) -> BTreeMap<String, String> {
    env.iter()
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
            let upper = key.to_ascii_uppercase();
            let value = if SENSITIVE_MARKERS.iter().any(|marker| upper.contains(marker)) {
                REDACTED.to_string()
            } else {
                value.to_string()
            };
            (key.to_string(), value)
        })
        .collect()
}

fn priority_for(action: &str, health: Option<&str>) -> Priority {
    match action {
        "die" | "kill" => Priority::High,
        "health_status" if health == Some("unhealthy") => Priority::High,
        _ => Priority::Normal,
    }
}

#[derive(Clone)]
struct WatcherWorker {
    runtime: Arc<dyn ContainerRuntime>,
    bus: Arc<EventBus>,
    log_tailer: Option<Arc<LogTailer>>,
    error_backoff: Duration,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ContainerEventWatcher {
    worker: WatcherWorker,
    task: Mutex<Option<RunningTask>>,
}

impl ContainerEventWatcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, bus: Arc<EventBus>) -> Self {
        Self {
            worker: WatcherWorker {
                runtime,
                bus,
                log_tailer: None,
                error_backoff: DEFAULT_ERROR_BACKOFF,
            },
            task: Mutex::new(None),
        }
    }

    /// Keep one log tail per running container in step with lifecycle events.
    pub fn with_log_tailer(mut self, tailer: Arc<LogTailer>) -> Self {
        self.worker.log_tailer = Some(tailer);
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.worker.error_backoff = backoff;
        self
    }

    pub fn start(&self) {
        let mut guard = self.task.lock().expect("watcher mutex poisoned");
        if guard.as_ref().map(|t| !t.handle.is_finished()).unwrap_or(false) {
            return;
        }
        let cancel = CancellationToken::new();
        let worker = self.worker.clone();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        *guard = Some(RunningTask { cancel, handle });
    }

    /// Cancel and wait. An event being processed is finished first.
    pub async fn stop(&self) {
        let task = self.task.lock().expect("watcher mutex poisoned").take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!("container watcher ended abnormally: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("watcher mutex poisoned")
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Process one runtime event. Returns the published event, if any.
    pub async fn handle_event(&self, event: &RuntimeEvent) -> Option<Event> {
        self.worker.process(event).await
    }
}

impl WatcherWorker {
    async fn run(self, cancel: CancellationToken) {
        tracing::info!("container watcher started");
        self.bootstrap_tails().await;

        let mut stream = match self.runtime.events().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to open runtime event stream: {e}");
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    self.process(&event).await;
                }
                Some(Err(e)) if e.is_fatal() => {
                    tracing::error!("runtime event stream lost: {e}");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!("bad runtime event, continuing: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
                None => {
                    tracing::error!("runtime event stream ended");
                    break;
                }
            }
        }
        tracing::info!("container watcher stopped");
    }

    async fn bootstrap_tails(&self) {
        let Some(tailer) = &self.log_tailer else {
            return;
        };
        match self.runtime.list_containers(false).await {
            Ok(containers) => {
                for container in containers.iter().filter(|c| c.state == "running") {
                    tailer.start(&container.id);
                }
            }
            Err(e) => tracing::warn!("could not list running containers for log tails: {e}"),
        }
    }

    async fn process(&self, event: &RuntimeEvent) -> Option<Event> {
        if event.kind != "container" || event.id.is_empty() {
            return None;
        }
        let (action, detail) = normalize_action(&event.action);
        if !WATCHED_ACTIONS.contains(&action.as_str()) {
            tracing::trace!(action = %event.action, "ignoring runtime action");
            return None;
        }

        let (details, missing_status) = if action == "destroy" {
            (None, STATUS_REMOVED)
        } else {
            match self.runtime.inspect(&event.id).await {
                Ok(details) => (Some(details), STATUS_REMOVED),
                Err(RuntimeError::NotFound(_)) => (None, STATUS_REMOVED),
                Err(e) => {
                    tracing::warn!(container_id = %event.id, "inspect failed: {e}");
                    (None, STATUS_UNKNOWN)
                }
            }
        };

        let resources = match &details {
            Some(d) if d.status == "running" => match self.runtime.stats(&event.id).await {
                Ok(sample) => ContainerResourceSnapshot::from_sample(&sample),
                Err(e) => {
                    tracing::warn!(container_id = %event.id, "stats read failed: {e}");
                    ContainerResourceSnapshot::default()
                }
            },
            _ => ContainerResourceSnapshot::default(),
        };

        let health = detail
            .clone()
            .or_else(|| details.as_ref().and_then(|d| d.health.clone()));
        let payload = build_payload(
            event,
            &action,
            details.as_ref(),
            missing_status,
            health.as_deref(),
            &resources,
        );
        let published = Event::new(EventType::ServiceUpdate, SOURCE_CONTAINER_WATCHER, payload)
            .with_priority(priority_for(&action, health.as_deref()))
            .with_correlation_id(event.id.clone());

        tracing::debug!(container_id = %event.id, action = %action, "publishing service update");
        self.bus.publish(published.clone());
        self.sync_log_tail(&action, &event.id).await;
        Some(published)
    }

    async fn sync_log_tail(&self, action: &str, container_id: &str) {
        let Some(tailer) = &self.log_tailer else {
            return;
        };
        match action {
            "start" | "restart" | "unpause" => {
                tailer.start(container_id);
            }
            "die" | "stop" | "kill" | "destroy" => {
                tailer.stop(container_id).await;
            }
            _ => {}
        }
    }
}

fn build_payload(
    event: &RuntimeEvent,
    action: &str,
    details: Option<&ContainerDetails>,
    missing_status: &str,
    health: Option<&str>,
    resources: &ContainerResourceSnapshot,
) -> serde_json::Value {
    let timestamp = Utc
        .timestamp_opt(event.time, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339();
    let attribute = |key: &str| event.attributes.get(key).cloned();

    match details {
        Some(d) => json!({
            "action": action,
            "container_id": event.id,
            "container_name": attribute("name").unwrap_or_else(|| d.name.clone()),
            "service_id": d.labels.get(SERVICE_ID_LABEL),
            "status": d.status,
            "image": if d.image.is_empty() { attribute("image").unwrap_or_default() } else { d.image.clone() },
            "health": health,
            "ports": d.ports,
            "environment": redact_env(&d.env),
            "labels": d.labels,
            "resources": resources,
            "timestamp": timestamp,
        }),
        None => json!({
            "action": action,
            "container_id": event.id,
            "container_name": attribute("name"),
            "service_id": attribute(SERVICE_ID_LABEL),
            "status": missing_status,
            "image": attribute("image"),
            "health": health,
            "ports": [],
            "environment": {},
            "labels": {},
            "resources": resources,
            "timestamp": timestamp,
        }),
    }
}
