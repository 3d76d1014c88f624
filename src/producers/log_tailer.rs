//! Per-container log streaming.
//!
//! One task per tailed container follows its timestamped log stream, parses
//! each line and publishes a `log_entry` event with source `logs:<id>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::event_types::log_source;
use crate::bus::{Event, EventBus, EventType, Priority};
use crate::docker::{ContainerRuntime, LogOptions};

pub const DEFAULT_TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Debug,
    Info,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Debug => "debug",
            Self::Info => "info",
        }
    }
}

const ERROR_MARKERS: [&str; 4] = ["error", "fatal", "exception", "panic"];
const WARNING_MARKERS: [&str; 1] = ["warn"];
const DEBUG_MARKERS: [&str; 2] = ["debug", "trace"];

/// Case-insensitive substring classification; the first matching level in
/// error, warning, debug order wins.
pub fn classify(message: &str) -> LogLevel {
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    if has(&ERROR_MARKERS) {
        LogLevel::Error
    } else if has(&WARNING_MARKERS) {
        LogLevel::Warning
    } else if has(&DEBUG_MARKERS) {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

const LEVEL_TOKENS: [&str; 9] = [
    "error", "err", "fatal", "warn", "warning", "debug", "trace", "info", "notice",
];

/// Drop a leading `ERROR`, `[WARN]`, `info:` style token.
fn strip_level_token(message: &str) -> &str {
    let Some((head, rest)) = message.split_once(char::is_whitespace) else {
        return message;
    };
    let token = head.trim_matches(|c| matches!(c, '[' | ']' | ':'));
    let rest = rest.trim_start();
    if !rest.is_empty() && LEVEL_TOKENS.iter().any(|t| token.eq_ignore_ascii_case(t)) {
        rest
    } else {
        message
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedLine {
    /// The runtime's own timestamp when present, else the receipt time.
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

/// Never fails: invalid UTF-8 is replaced and an unparseable timestamp
/// prefix is treated as part of the message.
pub fn parse_log_line(raw: &[u8], received_at: DateTime<Utc>) -> ParsedLine {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);

    let (timestamp, body, stamped) = match text.split_once(' ') {
        Some((prefix, rest))
            if prefix.ends_with('Z') && DateTime::parse_from_rfc3339(prefix).is_ok() =>
        {
            (prefix.to_string(), rest, true)
        }
        _ if text.ends_with('Z') && DateTime::parse_from_rfc3339(text).is_ok() => {
            (text.to_string(), "", true)
        }
        _ => (
            received_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            text,
            false,
        ),
    };

    // Only a runtime-stamped line has a known shape; unstamped text is kept verbatim.
    let message = if stamped { strip_level_token(body) } else { body };
    ParsedLine {
        timestamp,
        level: classify(body),
        message: message.to_string(),
    }
}

struct ActiveTail {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct TailerInner {
    runtime: Arc<dyn ContainerRuntime>,
    bus: Arc<EventBus>,
    tail_lines: usize,
    tails: DashMap<String, ActiveTail>,
    next_generation: AtomicU64,
}

/// Holds at most one active tail per container id.
#[derive(Clone)]
pub struct LogTailer {
    inner: Arc<TailerInner>,
}

impl LogTailer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, bus: Arc<EventBus>, tail_lines: usize) -> Self {
        Self {
            inner: Arc::new(TailerInner {
                runtime,
                bus,
                tail_lines,
                tails: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start following a container's logs. Returns `false` when a tail for
    /// this container is already active.
    pub fn start(&self, container_id: &str) -> bool {
        match self.inner.tails.entry(container_id.to_string()) {
            Entry::Occupied(existing) if !existing.get().handle.is_finished() => false,
            entry => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(run_tail(
                    self.inner.clone(),
                    container_id.to_string(),
                    generation,
                    cancel.clone(),
                ));
                let tail = ActiveTail {
                    generation,
                    cancel,
                    handle,
                };
                match entry {
                    Entry::Occupied(mut stale) => {
                        stale.insert(tail);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(tail);
                    }
                }
                tracing::debug!(container_id, "log tail started");
                true
            }
        }
    }

    /// Cancel the container's tail and wait for it. Returns `false` when
    /// nothing was being tailed.
    pub async fn stop(&self, container_id: &str) -> bool {
        let Some((_, tail)) = self.inner.tails.remove(container_id) else {
            return false;
        };
        tail.cancel.cancel();
        if let Err(e) = tail.handle.await {
            tracing::warn!(container_id, "log tail ended abnormally: {e}");
        }
        tracing::debug!(container_id, "log tail stopped");
        true
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.tails.iter().map(|t| t.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn is_tailing(&self, container_id: &str) -> bool {
        self.inner.tails.contains_key(container_id)
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.tails.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }
}

async fn run_tail(
    inner: Arc<TailerInner>,
    container_id: String,
    generation: u64,
    cancel: CancellationToken,
) {
    let options = LogOptions {
        follow: true,
        timestamps: true,
        tail: inner.tail_lines,
    };

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        opened = inner.runtime.logs(&container_id, options) => opened,
    };

    match opened {
        Ok(mut stream) => loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(raw)) => publish_line(&inner.bus, &container_id, &raw),
                Some(Err(e)) if e.is_fatal() => {
                    tracing::warn!(container_id = %container_id, "log stream lost: {e}");
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(container_id = %container_id, "skipping unreadable log chunk: {e}");
                }
                None => {
                    tracing::debug!(container_id = %container_id, "log stream ended");
                    break;
                }
            }
        },
        Err(e) => tracing::warn!(container_id = %container_id, "could not open log stream: {e}"),
    }

    inner
        .tails
        .remove_if(&container_id, |_, tail| tail.generation == generation);
}

fn publish_line(bus: &EventBus, container_id: &str, raw: &[u8]) {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    let line = parse_log_line(raw, Utc::now());
    let priority = match line.level {
        LogLevel::Error => Priority::Normal,
        _ => Priority::Low,
    };
    let payload = json!({
        "container_id": container_id,
        "timestamp": line.timestamp,
        "level": line.level,
        "message": line.message,
    });
    tracing::trace!(container_id, level = line.level.as_str(), "log line");
    bus.publish(
        Event::new(EventType::LogEntry, log_source(container_id), payload)
            .with_priority(priority)
            .with_correlation_id(container_id),
    );
}
