//! Container runtime collaborator.
//!
//! Producers only see the [`ContainerRuntime`] trait. [`DockerClient`] binds
//! it to the Docker Engine HTTP API; tests substitute a scripted fake.

mod client;
mod decode;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use client::{normalize_docker_host, DockerClient};
pub use decode::{ChunkDecoder, LineSplitter, LogDecoder};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("runtime connection error: {0}")]
    Connection(String),
    #[error("runtime returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("failed to decode runtime response: {0}")]
    Decode(String),
    #[error("runtime stream closed")]
    StreamClosed,
    #[error("unsupported runtime endpoint: {0}")]
    Unsupported(String),
}

impl RuntimeError {
    /// True when the runtime connection itself is gone, as opposed to a
    /// single unreadable item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::StreamClosed | Self::Unsupported(_)
        )
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return Self::Decode(value.to_string());
        }
        Self::Connection(value.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: String,
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub health: Option<String>,
    pub ports: Vec<PortBinding>,
    /// Raw `KEY=VALUE` pairs as reported by the runtime.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub created: Option<String>,
    pub started_at: Option<String>,
}

/// One cumulative CPU counter read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuCounters {
    pub total_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
}

/// Two consecutive counter reads plus the memory and network totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    pub cpu: CpuCounters,
    pub precpu: CpuCounters,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Object class, e.g. `container`, `network`, `image`.
    pub kind: String,
    pub action: String,
    pub id: String,
    pub attributes: BTreeMap<String, String>,
    /// Unix seconds.
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub timestamps: bool,
    pub tail: usize,
}

pub type EventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;
/// Raw log lines without the trailing newline, not yet decoded.
pub type LogStream = BoxStream<'static, Result<Vec<u8>, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<StatsSample, RuntimeError>;

    async fn events(&self) -> Result<EventStream, RuntimeError>;

    async fn logs(&self, id: &str, options: LogOptions) -> Result<LogStream, RuntimeError>;
}
