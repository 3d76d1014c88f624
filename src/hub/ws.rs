//! HTTP surface: `GET /ws` upgrades to the event stream, `GET /health`
//! reports bus and hub counters.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::auth::{extract_token, TokenVerifier};
use super::broadcast::{BroadcastHub, ConnectionId};
use super::protocol::{ControlPlane, ErrorCode};
use super::OutboundMessage;
use crate::bus::EventBus;

#[derive(Clone)]
pub struct WsContext {
    pub hub: Arc<BroadcastHub>,
    pub bus: Arc<EventBus>,
    pub control: Arc<ControlPlane>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl WsContext {
    pub fn new(hub: Arc<BroadcastHub>, bus: Arc<EventBus>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            control: Arc::new(ControlPlane::new(hub.clone(), bus.clone())),
            hub,
            bus,
            verifier,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub fn router(ctx: WsContext) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health))
        .with_state(ctx)
}

async fn health(State(ctx): State<WsContext>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "bus": ctx.bus.stats(),
        "hub": ctx.hub.stats(),
    }))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    query: Result<Query<WsQuery>, QueryRejection>,
    headers: HeaderMap,
    State(ctx): State<WsContext>,
) -> Response {
    // An unreadable query string only costs the client its token.
    let query = query.map(|Query(query)| query).unwrap_or_else(|e| {
        tracing::debug!("ignoring malformed websocket query: {e}");
        WsQuery::default()
    });
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let principal = extract_token(query.token.as_deref(), authorization)
        .and_then(|token| ctx.verifier.verify(&token));
    tracing::debug!(authenticated = principal.is_some(), "websocket upgrade requested");

    ws.on_upgrade(move |socket| async move {
        let (id, outbound) = ctx.hub.connect(principal);
        handle_socket(socket, ctx, id, outbound).await;
    })
    .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    ctx: WsContext,
    id: ConnectionId,
    mut outbound: tokio::sync::mpsc::Receiver<String>,
) {
    let (mut sink, mut stream) = socket.split();

    // Writer: drains the hub's queue for this connection. The queue ends when
    // the hub drops the connection.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                tracing::debug!(connection = %id, "socket write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    if let Err(e) = ctx.hub.accept(id) {
        tracing::warn!(connection = %id, "could not open connection: {e}");
        ctx.hub.disconnect(id);
        let _ = writer.await;
        return;
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => ctx.control.handle_text(id, &text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => ctx.control.handle_text(id, text),
                Err(_) => {
                    ctx.hub.send(
                        id,
                        OutboundMessage::error(ErrorCode::InvalidJson, "Invalid JSON: binary frame is not UTF-8"),
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::debug!(connection = %id, "client closed connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => ctx.hub.record_inbound(id),
            Err(e) => {
                tracing::debug!(connection = %id, "socket read failed: {e}");
                break;
            }
        }
        if !ctx.hub.is_open(id) {
            break;
        }
    }

    ctx.hub.disconnect(id);
    if let Err(e) = writer.await {
        tracing::warn!(connection = %id, "socket writer ended abnormally: {e}");
    }
}
