use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::decode::{decode_lines, LineSplitter, LogDecoder};
use super::{
    ContainerDetails, ContainerRuntime, ContainerSummary, CpuCounters, EventStream, LogOptions,
    LogStream, PortBinding, RuntimeError, RuntimeEvent, StatsSample,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONTAINER_EVENTS_FILTER: &str = r#"{"type":["container"]}"#;

/// Rewrite a `DOCKER_HOST` value into an HTTP base URL.
///
/// Only TCP endpoints are reachable through this binding.
pub fn normalize_docker_host(host: &str) -> Result<String, RuntimeError> {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() {
        return Err(RuntimeError::Unsupported("empty DOCKER_HOST".into()));
    }
    if let Some(rest) = host.strip_prefix("tcp://") {
        return Ok(format!("http://{rest}"));
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        return Ok(host.to_string());
    }
    if host.starts_with("unix://") || host.starts_with("npipe://") {
        return Err(RuntimeError::Unsupported(format!(
            "{host} (expose the engine on tcp:// to use it)"
        )));
    }
    Ok(format!("http://{host}"))
}

/// Docker Engine API client.
#[derive(Clone)]
pub struct DockerClient {
    http: reqwest::Client,
    base_url: String,
}

impl DockerClient {
    pub fn new(docker_host: &str) -> Result<Self, RuntimeError> {
        let base_url = normalize_docker_host(docker_host)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RuntimeError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        not_found_id: Option<&str>,
    ) -> Result<T, RuntimeError> {
        let response = self
            .http
            .get(self.url(path))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = check_status(response, not_found_id).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn open_stream(
        &self,
        path: &str,
        not_found_id: Option<&str>,
    ) -> Result<reqwest::Response, RuntimeError> {
        let response = self.http.get(self.url(path)).send().await?;
        check_status(response, not_found_id).await
    }
}

async fn check_status(
    response: reqwest::Response,
    not_found_id: Option<&str>,
) -> Result<reqwest::Response, RuntimeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        if let Some(id) = not_found_id {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
    }
    let message = response
        .json::<EngineErrorBody>()
        .await
        .map(|body| body.message)
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown").to_string());
    Err(RuntimeError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let raw: Vec<EngineContainerSummary> = self
            .get_json(&format!("/containers/json?all={all}"), None)
            .await?;
        Ok(raw.into_iter().map(ContainerSummary::from).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let raw: EngineInspect = self
            .get_json(&format!("/containers/{id}/json"), Some(id))
            .await?;
        Ok(raw.into())
    }

    async fn stats(&self, id: &str) -> Result<StatsSample, RuntimeError> {
        let raw: EngineStats = self
            .get_json(&format!("/containers/{id}/stats?stream=false"), Some(id))
            .await?;
        Ok(raw.into())
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let path = format!(
            "/events?filters={}",
            urlencoding::encode(CONTAINER_EVENTS_FILTER)
        );
        let response = self.open_stream(&path, None).await?;
        let lines = decode_lines(response.bytes_stream().boxed(), LineSplitter::default());
        Ok(lines
            .filter_map(|line| async move {
                match line {
                    Ok(line) if line.iter().all(u8::is_ascii_whitespace) => None,
                    Ok(line) => Some(parse_event(&line)),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed())
    }

    async fn logs(&self, id: &str, options: LogOptions) -> Result<LogStream, RuntimeError> {
        let path = format!(
            "/containers/{id}/logs?follow={}&timestamps={}&tail={}&stdout=1&stderr=1",
            options.follow, options.timestamps, options.tail
        );
        let response = self.open_stream(&path, Some(id)).await?;
        Ok(decode_lines(response.bytes_stream().boxed(), LogDecoder::default()))
    }
}

fn parse_event(line: &[u8]) -> Result<RuntimeEvent, RuntimeError> {
    let raw: EngineEvent = serde_json::from_slice(line)?;
    Ok(raw.into())
}

// ---------------------------------------------------------------------------
// Engine wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct EngineErrorBody {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EngineContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
}

impl From<EngineContainerSummary> for ContainerSummary {
    fn from(value: EngineContainerSummary) -> Self {
        let name = value
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        Self {
            id: value.id,
            name,
            image: value.image,
            state: value.state,
            status: value.status,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EngineInspect {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    state: EngineState,
    #[serde(default)]
    config: EngineConfig,
    #[serde(default)]
    network_settings: EngineNetworkSettings,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct EngineState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    health: Option<EngineHealth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EngineHealth {
    status: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct EngineConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct EngineNetworkSettings {
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<EnginePortBinding>>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnginePortBinding {
    #[serde(default)]
    host_ip: Option<String>,
    #[serde(default)]
    host_port: Option<String>,
}

impl From<EngineInspect> for ContainerDetails {
    fn from(value: EngineInspect) -> Self {
        let mut ports = Vec::new();
        for (container_port, bindings) in value.network_settings.ports.unwrap_or_default() {
            match bindings {
                Some(bindings) if !bindings.is_empty() => {
                    for binding in bindings {
                        ports.push(PortBinding {
                            container_port: container_port.clone(),
                            host_ip: binding.host_ip.filter(|ip| !ip.is_empty()),
                            host_port: binding.host_port.filter(|port| !port.is_empty()),
                        });
                    }
                }
                _ => ports.push(PortBinding {
                    container_port,
                    host_ip: None,
                    host_port: None,
                }),
            }
        }

        Self {
            id: value.id,
            name: value.name.trim_start_matches('/').to_string(),
            image: value.config.image,
            status: value.state.status,
            health: value.state.health.map(|h| h.status),
            ports,
            env: value.config.env.unwrap_or_default(),
            labels: value.config.labels.unwrap_or_default(),
            created: value.created,
            started_at: value.state.started_at,
        }
    }
}

#[derive(Deserialize, Default)]
struct EngineStats {
    #[serde(default)]
    cpu_stats: EngineCpuStats,
    #[serde(default)]
    precpu_stats: EngineCpuStats,
    #[serde(default)]
    memory_stats: EngineMemoryStats,
    #[serde(default)]
    networks: Option<HashMap<String, EngineNetworkStats>>,
}

#[derive(Deserialize, Default)]
struct EngineCpuStats {
    #[serde(default)]
    cpu_usage: EngineCpuUsage,
    #[serde(default)]
    system_cpu_usage: Option<u64>,
    #[serde(default)]
    online_cpus: Option<u32>,
}

#[derive(Deserialize, Default)]
struct EngineCpuUsage {
    #[serde(default)]
    total_usage: u64,
    #[serde(default)]
    percpu_usage: Option<Vec<u64>>,
}

#[derive(Deserialize, Default)]
struct EngineMemoryStats {
    #[serde(default)]
    usage: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Deserialize, Default)]
struct EngineNetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

impl From<EngineCpuStats> for CpuCounters {
    fn from(value: EngineCpuStats) -> Self {
        let online_cpus = value.online_cpus.filter(|n| *n > 0).unwrap_or_else(|| {
            value
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per_cpu| per_cpu.len() as u32)
                .unwrap_or(0)
        });
        Self {
            total_usage: value.cpu_usage.total_usage,
            system_usage: value.system_cpu_usage.unwrap_or(0),
            online_cpus,
        }
    }
}

impl From<EngineStats> for StatsSample {
    fn from(value: EngineStats) -> Self {
        let (rx_bytes, tx_bytes) = value
            .networks
            .unwrap_or_default()
            .values()
            .fold((0u64, 0u64), |(rx, tx), net| {
                (rx.saturating_add(net.rx_bytes), tx.saturating_add(net.tx_bytes))
            });
        Self {
            cpu: value.cpu_stats.into(),
            precpu: value.precpu_stats.into(),
            memory_usage: value.memory_stats.usage.unwrap_or(0),
            memory_limit: value.memory_stats.limit.unwrap_or(0),
            rx_bytes,
            tx_bytes,
        }
    }
}

#[derive(Deserialize)]
struct EngineEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: EngineActor,
    #[serde(default)]
    time: i64,
}

#[derive(Deserialize, Default)]
struct EngineActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

impl From<EngineEvent> for RuntimeEvent {
    fn from(value: EngineEvent) -> Self {
        Self {
            kind: value.kind,
            action: value.action,
            id: value.actor.id,
            attributes: value.actor.attributes,
            time: value.time,
        }
    }
}

#[cfg(test)]
mod tests;
