//! Shared harness for the WebSocket endpoint tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetstream::bus::EventBus;
use fleetstream::docker::{
    ContainerDetails, ContainerRuntime, ContainerSummary, EventStream, LogOptions, LogStream,
    RuntimeError, StatsSample,
};
use fleetstream::hub::{router, BroadcastHub, HubRelay, TokenVerifier, WsContext};
use fleetstream::producers::{HostProbe, HostSample};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bus, hub and relay behind a real axum listener on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub bus: Arc<EventBus>,
    pub hub: Arc<BroadcastHub>,
}

pub async fn spawn_server(verifier: Arc<dyn TokenVerifier>) -> TestServer {
    let bus = Arc::new(EventBus::default());
    let hub = Arc::new(BroadcastHub::default());
    bus.start();
    bus.subscribe_global(Arc::new(HubRelay::new(hub.clone())), None, 0);

    let app = router(WsContext::new(hub.clone(), bus.clone(), verifier));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, bus, hub }
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connect and consume the welcome frame.
    pub async fn connect(&self) -> (Client, Value) {
        connect_url(&self.ws_url()).await
    }
}

pub async fn connect_url(url: &str) -> (Client, Value) {
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let welcome = next_frame(&mut client).await.expect("welcome frame");
    assert_eq!(welcome["type"], "connection_established");
    (client, welcome)
}

pub async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next JSON text frame, or `None` if nothing arrives within 500ms.
pub async fn next_frame(client: &mut Client) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_millis(500), client.next())
            .await
            .ok()??
            .ok()?;
        match message {
            Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// A runtime with no containers whose event stream never yields.
pub struct IdleRuntime;

#[async_trait]
impl ContainerRuntime for IdleRuntime {
    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        Err(RuntimeError::NotFound(id.to_string()))
    }

    async fn stats(&self, id: &str) -> Result<StatsSample, RuntimeError> {
        Err(RuntimeError::NotFound(id.to_string()))
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        Ok(futures::stream::pending().boxed())
    }

    async fn logs(&self, id: &str, _options: LogOptions) -> Result<LogStream, RuntimeError> {
        Err(RuntimeError::NotFound(id.to_string()))
    }
}

pub struct FixedProbe;

impl HostProbe for FixedProbe {
    fn sample(&mut self) -> HostSample {
        HostSample {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            cpu_count: 2,
            ..HostSample::default()
        }
    }
}
