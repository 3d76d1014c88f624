//! Fleet telemetry backend.
//!
//! Observes the container runtime, the host, container logs and operator
//! notifications, and fans the resulting events out to WebSocket clients.
//!
//! # Architecture
//!
//! - `bus`: priority-laned event bus every producer publishes into
//! - `producers`: container watcher, metrics sampler, log tailer, notifications
//! - `docker`: container runtime trait and the Engine API binding
//! - `hub`: connection registry, channel routing, control protocol, `/ws`
//! - `config`: environment configuration

pub mod bus;
pub mod config;
pub mod docker;
pub mod hub;
pub mod producers;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::{Arc, Mutex};

use axum::Router;
use tokio::net::TcpListener;

use bus::{EventBus, SubscriptionHandle};
use config::{Config, ConfigError};
use docker::{ContainerRuntime, DockerClient, RuntimeError};
use hub::{AllowAnonymous, BroadcastHub, HubRelay, StaticTokenVerifier, TokenVerifier, WsContext};
use producers::{
    ContainerEventWatcher, HostProbe, LogTailer, MetricsSampler, NotificationCenter, SysinfoProbe,
};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

/// Every long-lived component, wired together.
pub struct AppState {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub hub: Arc<BroadcastHub>,
    pub watcher: Arc<ContainerEventWatcher>,
    pub log_tailer: Arc<LogTailer>,
    pub metrics: Arc<MetricsSampler>,
    pub notifications: NotificationCenter,
    verifier: Arc<dyn TokenVerifier>,
    relay: Mutex<Option<SubscriptionHandle>>,
}

impl AppState {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>, probe: Box<dyn HostProbe>) -> Self {
        let bus = Arc::new(EventBus::new(config.bus.clone()));
        let hub = Arc::new(BroadcastHub::new(config.connection_buffer));
        let log_tailer = Arc::new(LogTailer::new(
            runtime.clone(),
            bus.clone(),
            config.log_tail_lines,
        ));
        let watcher = Arc::new(
            ContainerEventWatcher::new(runtime, bus.clone()).with_log_tailer(log_tailer.clone()),
        );
        let metrics = Arc::new(MetricsSampler::new(bus.clone(), probe, config.metrics.clone()));
        let notifications = NotificationCenter::new(bus.clone(), config.notifications.clone());
        let verifier: Arc<dyn TokenVerifier> = if config.tokens.is_empty() {
            Arc::new(AllowAnonymous)
        } else {
            Arc::new(StaticTokenVerifier::new(config.tokens.iter().cloned()))
        };

        Self {
            config,
            bus,
            hub,
            watcher,
            log_tailer,
            metrics,
            notifications,
            verifier,
            relay: Mutex::new(None),
        }
    }

    /// Docker Engine runtime and the `sysinfo` host probe.
    pub fn from_config(config: Config) -> Result<Self, AppError> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerClient::new(&config.docker_host)?);
        Ok(Self::new(config, runtime, Box::new(SysinfoProbe::new())))
    }

    pub fn router(&self) -> Router {
        hub::router(WsContext::new(
            self.hub.clone(),
            self.bus.clone(),
            self.verifier.clone(),
        ))
    }

    /// Start the bus, hook the hub to it, then start every producer and the
    /// heartbeat. Safe to call again after `shutdown`.
    pub fn start(&self) {
        self.bus.start();
        {
            let mut relay = self.relay.lock().expect("relay mutex poisoned");
            if relay.is_none() {
                let handler = Arc::new(HubRelay::new(self.hub.clone()));
                *relay = Some(self.bus.subscribe_global(handler, None, 0));
            }
        }
        self.watcher.start();
        self.metrics.start();
        self.hub.start_heartbeat(self.config.heartbeat);
        tracing::info!(bind = %self.config.bind, "fleetstream started");
    }

    /// Stop producers first so the bus can drain what they already queued,
    /// then close every client connection.
    pub async fn shutdown(&self) {
        self.watcher.stop().await;
        self.log_tailer.stop_all().await;
        self.metrics.stop().await;
        self.notifications.stop().await;
        self.bus.stop().await;

        let relay = self.relay.lock().expect("relay mutex poisoned").take();
        if let Some(relay) = relay {
            relay.unsubscribe();
        }
        self.hub.stop_heartbeat().await;
        let closed = self.hub.close_all();
        tracing::info!(closed, "fleetstream stopped");
    }
}

// ---------------------------------------------------------------------------
// Application entry point
// ---------------------------------------------------------------------------

/// Serve `state` on `listener` until `shutdown` resolves, then stop every
/// component.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<(), AppError>
where
    F: Future<Output = ()> + Send + 'static,
{
    state.start();
    let app = state.router();

    let hub = state.hub.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            // Upgraded sockets would otherwise keep graceful shutdown waiting.
            hub.close_all();
        })
        .await;

    state.shutdown().await;
    result.map_err(AppError::from)
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

pub fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetstream=debug,info".parse().expect("valid env filter")),
        )
        .init();

    let config = Config::from_env()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.blocking_threads)
        .build()?;

    runtime.block_on(async move {
        let state = Arc::new(AppState::from_config(config)?);
        let listener = TcpListener::bind(state.config.bind).await?;
        tracing::info!(addr = %listener.local_addr()?, docker = %state.config.docker_host, "listening");
        serve(listener, state, ctrl_c()).await
    })
}
