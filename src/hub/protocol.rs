//! Inbound control protocol.
//!
//! Client frames are `{type, data}` JSON objects. Malformed input is answered
//! with an error frame to the offending connection only; the connection stays
//! open.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use super::broadcast::{BroadcastHub, ConnectionId, OutboundMessage};
use crate::bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    MissingEventType,
    UnknownMessageType,
    MessageHandlingError,
    InternalError,
}

/// Parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    Subscribe(String),
    Unsubscribe(String),
    GetStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub fn parse(text: &str) -> Result<ControlMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::new(ErrorCode::InvalidJson, format!("Invalid JSON: {e}")))?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::new(
            ErrorCode::InvalidJson,
            "Invalid JSON: expected an object",
        ));
    };
    let kind = object.get("type").and_then(Value::as_str).unwrap_or_default();
    let event_type = || {
        object
            .get("data")
            .and_then(|d| d.get("event_type"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::new(ErrorCode::MissingEventType, "Missing event_type"))
    };
    match kind {
        "ping" => Ok(ControlMessage::Ping),
        "subscribe" => event_type().map(ControlMessage::Subscribe),
        "unsubscribe" => event_type().map(ControlMessage::Unsubscribe),
        "get_stats" => Ok(ControlMessage::GetStats),
        other => Err(ProtocolError::new(
            ErrorCode::UnknownMessageType,
            format!("Unknown message type: {other}"),
        )),
    }
}

/// Applies client control messages to the hub.
pub struct ControlPlane {
    hub: Arc<BroadcastHub>,
    bus: Arc<EventBus>,
}

impl ControlPlane {
    pub fn new(hub: Arc<BroadcastHub>, bus: Arc<EventBus>) -> Self {
        Self { hub, bus }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn handle_text(&self, id: ConnectionId, text: &str) {
        self.hub.record_inbound(id);
        let message = match parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection = %id, code = ?e.code, "rejected client frame");
                self.reply_error(id, e.code, e.message);
                return;
            }
        };
        tracing::trace!(connection = %id, ?message, "client frame");

        match message {
            ControlMessage::Ping => {
                self.hub.send(
                    id,
                    OutboundMessage::new("pong", json!({ "connection_id": id.to_string() })),
                );
            }
            ControlMessage::Subscribe(channel) => {
                if let Err(e) = self.hub.subscribe(id, &channel) {
                    self.reply_error(id, ErrorCode::MessageHandlingError, e.to_string());
                }
            }
            ControlMessage::Unsubscribe(channel) => {
                if let Err(e) = self.hub.unsubscribe(id, &channel) {
                    self.reply_error(id, ErrorCode::MessageHandlingError, e.to_string());
                }
            }
            ControlMessage::GetStats => self.send_stats(id),
        }
    }

    fn send_stats(&self, id: ConnectionId) {
        let data = serde_json::to_value(self.hub.stats()).and_then(|hub| {
            Ok(json!({
                "hub": hub,
                "bus": serde_json::to_value(self.bus.stats())?,
                "connection": serde_json::to_value(self.hub.connection_stats(id))?,
            }))
        });
        match data {
            Ok(data) => {
                self.hub.send(id, OutboundMessage::new("stats", data));
            }
            Err(e) => {
                tracing::error!(connection = %id, "failed to encode stats: {e}");
                self.reply_error(id, ErrorCode::InternalError, "Failed to collect stats");
            }
        }
    }

    fn reply_error(&self, id: ConnectionId, code: ErrorCode, message: impl Into<String>) {
        self.hub.send(id, OutboundMessage::error(code, message));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn parse_recognizes_every_message() {
        assert_eq!(parse(r#"{"type":"ping"}"#), Ok(ControlMessage::Ping));
        assert_eq!(
            parse(r#"{"type":"subscribe","data":{"event_type":"log_entries"}}"#),
            Ok(ControlMessage::Subscribe("log_entries".to_string()))
        );
        assert_eq!(
            parse(r#"{"type":"unsubscribe","data":{"event_type":"notifications"}}"#),
            Ok(ControlMessage::Unsubscribe("notifications".to_string()))
        );
        assert_eq!(parse(r#"{"type":"get_stats","data":{}}"#), Ok(ControlMessage::GetStats));
    }

    #[test]
    fn parse_maps_failures_to_codes() {
        let code = |text: &str| parse(text).unwrap_err().code;
        assert_eq!(code("not json"), ErrorCode::InvalidJson);
        assert_eq!(code("[1,2]"), ErrorCode::InvalidJson);
        assert_eq!(code(r#"{"type":"subscribe"}"#), ErrorCode::MissingEventType);
        assert_eq!(
            code(r#"{"type":"unsubscribe","data":{"event_type":"  "}}"#),
            ErrorCode::MissingEventType
        );
        assert_eq!(code(r#"{"type":"unknown_x"}"#), ErrorCode::UnknownMessageType);
        assert_eq!(code(r#"{"data":{}}"#), ErrorCode::UnknownMessageType);
    }

    fn setup() -> (ControlPlane, ConnectionId, mpsc::Receiver<String>) {
        let hub = Arc::new(BroadcastHub::default());
        let (id, mut rx) = hub.connect(None);
        hub.accept(id).unwrap();
        while rx.try_recv().is_ok() {}
        (ControlPlane::new(hub, Arc::new(EventBus::default())), id, rx)
    }

    fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn errors_go_to_sender_and_connection_stays_open() {
        let (control, id, mut rx) = setup();

        control.handle_text(id, r#"{"type":"unknown_x"}"#);
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "UNKNOWN_MESSAGE_TYPE");
        assert!(rx.try_recv().is_err());

        control.handle_text(id, "{oops");
        let frame = next(&mut rx);
        assert_eq!(frame["data"]["code"], "INVALID_JSON");
        assert!(rx.try_recv().is_err());

        assert!(control.hub().is_open(id));
        control.handle_text(id, r#"{"type":"ping"}"#);
        assert_eq!(next(&mut rx)["type"], "pong");
    }

    #[test]
    fn subscribe_round_trip_and_stats() {
        let (control, id, mut rx) = setup();

        control.handle_text(id, r#"{"type":"subscribe","data":{"event_type":"log_entries"}}"#);
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "subscription_confirmed");
        assert_eq!(frame["data"]["event_type"], "log_entries");

        control.handle_text(id, r#"{"type":"subscribe","data":{}}"#);
        assert_eq!(next(&mut rx)["data"]["code"], "MISSING_EVENT_TYPE");

        control.handle_text(id, r#"{"type":"get_stats"}"#);
        let stats = next(&mut rx);
        assert_eq!(stats["type"], "stats");
        assert_eq!(stats["data"]["hub"]["active_connections"], 1);
        assert_eq!(stats["data"]["connection"]["channels"][0], "log_entries");
        assert_eq!(stats["data"]["connection"]["messages_received"], 3);
        assert!(stats["data"]["bus"]["dropped"].is_number());

        control.handle_text(id, r#"{"type":"unsubscribe","data":{"event_type":"log_entries"}}"#);
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "unsubscription_confirmed");
        assert_eq!(frame["data"]["subscriptions"], json!([]));
    }
}
