//! Process configuration from the environment (and an optional `.env`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::BusConfig;
use crate::docker::normalize_docker_host;
use crate::producers::{MetricsConfig, NotificationConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    /// Engine API base URL, already normalized to `http(s)://`.
    pub docker_host: String,
    pub blocking_threads: usize,
    pub bus: BusConfig,
    pub metrics: MetricsConfig,
    pub log_tail_lines: usize,
    pub notifications: NotificationConfig,
    pub heartbeat: Duration,
    pub connection_buffer: usize,
    /// `user -> token`.
    pub tokens: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8765)),
            docker_host: "http://127.0.0.1:2375".to_string(),
            blocking_threads: 8,
            bus: BusConfig::default(),
            metrics: MetricsConfig::default(),
            log_tail_lines: crate::producers::log_tailer::DEFAULT_TAIL_LINES,
            notifications: NotificationConfig::default(),
            heartbeat: crate::hub::DEFAULT_HEARTBEAT,
            connection_buffer: crate::hub::DEFAULT_CONNECTION_BUFFER,
            tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!("ignoring unreadable .env: {e}"),
        }
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit `(name, value)` pairs; unset names keep defaults.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let mut config = Self::default();

        if let Some(raw) = get("FLEETSTREAM_BIND") {
            config.bind = parse("FLEETSTREAM_BIND", raw)?;
        }
        if let Some(raw) = get("DOCKER_HOST") {
            config.docker_host =
                normalize_docker_host(raw).map_err(|e| invalid("DOCKER_HOST", raw, e))?;
        }
        if let Some(raw) = get("FLEETSTREAM_BLOCKING_THREADS") {
            config.blocking_threads = positive("FLEETSTREAM_BLOCKING_THREADS", raw)?;
        }
        if let Some(raw) = get("FLEETSTREAM_LANE_CAPACITY") {
            config.bus.lane_capacity = positive("FLEETSTREAM_LANE_CAPACITY", raw)?;
        }
        if let Some(raw) = get("FLEETSTREAM_HISTORY_SIZE") {
            config.bus.history_size = parse("FLEETSTREAM_HISTORY_SIZE", raw)?;
        }
        if let Some(raw) = get("FLEETSTREAM_HANDLER_TIMEOUT_MS") {
            config.bus.handler_timeout =
                Duration::from_millis(positive::<u64>("FLEETSTREAM_HANDLER_TIMEOUT_MS", raw)?);
        }
        if let Some(raw) = get("FLEETSTREAM_METRICS_INTERVAL_SECS") {
            config.metrics.interval =
                Duration::from_secs(positive::<u64>("FLEETSTREAM_METRICS_INTERVAL_SECS", raw)?);
        }
        if let Some(raw) = get("FLEETSTREAM_METRICS_THRESHOLD") {
            let threshold: f64 = parse("FLEETSTREAM_METRICS_THRESHOLD", raw)?;
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(invalid(
                    "FLEETSTREAM_METRICS_THRESHOLD",
                    raw,
                    "must be a non-negative number",
                ));
            }
            config.metrics.threshold = threshold;
        }
        if let Some(raw) = get("FLEETSTREAM_METRICS_MAX_SILENCE_SECS") {
            config.metrics.max_silence = Duration::from_secs(positive::<u64>(
                "FLEETSTREAM_METRICS_MAX_SILENCE_SECS",
                raw,
            )?);
        }
        if let Some(raw) = get("FLEETSTREAM_LOG_TAIL_LINES") {
            config.log_tail_lines = parse("FLEETSTREAM_LOG_TAIL_LINES", raw)?;
        }
        if let Some(raw) = get("FLEETSTREAM_NOTIFICATION_CAPACITY") {
            config.notifications.capacity = positive("FLEETSTREAM_NOTIFICATION_CAPACITY", raw)?;
        }
        if let Some(raw) = get("FLEETSTREAM_NOTIFICATION_EVICT_BATCH") {
            config.notifications.evict_batch =
                parse("FLEETSTREAM_NOTIFICATION_EVICT_BATCH", raw)?;
        }
        if let Some(raw) = get("FLEETSTREAM_HEARTBEAT_SECS") {
            config.heartbeat =
                Duration::from_secs(positive::<u64>("FLEETSTREAM_HEARTBEAT_SECS", raw)?);
        }
        if let Some(raw) = get("FLEETSTREAM_CONNECTION_BUFFER") {
            config.connection_buffer = positive("FLEETSTREAM_CONNECTION_BUFFER", raw)?;
        }
        if let Some(raw) = get("FLEETSTREAM_TOKENS") {
            config.tokens = parse_tokens(raw)?;
        }

        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| invalid(var, raw, e))
}

fn positive<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value: T = parse(var, raw)?;
    if value <= T::default() {
        return Err(invalid(var, raw, "must be greater than zero"));
    }
    Ok(value)
}

/// `alice:tok1,bob:tok2`
fn parse_tokens(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((user, token)) if !user.trim().is_empty() && !token.trim().is_empty() => {
                Ok((user.trim().to_string(), token.trim().to_string()))
            }
            _ => Err(invalid(
                "FLEETSTREAM_TOKENS",
                entry,
                "expected comma-separated user:token pairs",
            )),
        })
        .collect()
}
