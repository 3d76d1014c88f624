//! Connection registry and sequenced fan-out.
//!
//! Every write is a non-blocking `try_send` into the connection's bounded
//! outbound queue; the socket writer task drains it. A full or closed queue
//! disconnects the connection on the spot, so a slow consumer can never hold
//! up a broadcast.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::auth::Principal;
use crate::bus::event_types::BUILTIN_CHANNELS;

pub const DEFAULT_CONNECTION_BUFFER: usize = 256;
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Terminal. A closed connection's metadata is gone.
    Closed,
}

/// Server-to-client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
            sequence: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
        self
    }

    pub fn error(code: impl Serialize, error: impl Into<String>) -> Self {
        Self::new("error", json!({ "error": error.into(), "code": code }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub principal: Option<String>,
    pub channels: Vec<String>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub broadcasts: u64,
    pub slow_consumer_disconnects: u64,
    pub last_sequence: u64,
    pub channels: BTreeMap<String, usize>,
}

struct Connection {
    state: ConnectionState,
    principal: Option<Principal>,
    channels: HashSet<String>,
    outbound: mpsc::Sender<String>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    messages_sent: u64,
    messages_received: u64,
}

impl Connection {
    /// No channel subscriptions means the connection takes everything.
    fn wants(&self, channels: &[&str]) -> bool {
        self.channels.is_empty() || channels.iter().any(|c| self.channels.contains(*c))
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<String, HashSet<ConnectionId>>,
    next_connection: u64,
    sequence: u64,
    total_connections: u64,
    messages_sent: u64,
    broadcasts: u64,
    slow_consumer_disconnects: u64,
}

enum WriteOutcome {
    Sent,
    Dead,
}

impl HubState {
    fn stamp(&mut self, message: &mut OutboundMessage) {
        if message.sequence.is_none() {
            self.sequence += 1;
            message.sequence = Some(self.sequence);
        }
        if message.timestamp.is_none() {
            message.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
    }

    fn write(&mut self, id: ConnectionId, frame: &str) -> WriteOutcome {
        let Some(connection) = self.connections.get_mut(&id) else {
            return WriteOutcome::Dead;
        };
        if connection.state == ConnectionState::Closed {
            return WriteOutcome::Dead;
        }
        match connection.outbound.try_send(frame.to_string()) {
            Ok(()) => {
                connection.messages_sent += 1;
                connection.last_activity = Utc::now();
                self.messages_sent += 1;
                WriteOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection = %id, "outbound queue full, dropping slow consumer");
                self.slow_consumer_disconnects += 1;
                WriteOutcome::Dead
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection = %id, "outbound queue closed");
                WriteOutcome::Dead
            }
        }
    }

    /// Removes the connection from every channel before dropping it.
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(mut connection) = self.connections.remove(&id) else {
            return false;
        };
        for channel in connection.channels.drain() {
            if let Some(members) = self.channels.get_mut(&channel) {
                members.remove(&id);
                if members.is_empty() {
                    self.channels.remove(&channel);
                }
            }
        }
        true
    }

    fn open_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Open)
            .map(|(id, _)| *id)
    }

    /// One sequence number for the whole call, shared by every recipient.
    fn fan_out(
        &mut self,
        mut message: OutboundMessage,
        targets: Vec<ConnectionId>,
    ) -> Result<usize, HubError> {
        self.stamp(&mut message);
        self.broadcasts += 1;
        let frame = serde_json::to_string(&message)?;
        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in targets {
            match self.write(id, &frame) {
                WriteOutcome::Sent => delivered += 1,
                WriteOutcome::Dead => dead.push(id),
            }
        }
        for id in dead {
            self.remove(id);
        }
        Ok(delivered)
    }
}

struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of live connections and their channel subscriptions.
pub struct BroadcastHub {
    state: Mutex<HubState>,
    buffer: usize,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            buffer: buffer.max(1),
            heartbeat: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().expect("hub state poisoned")
    }

    /// Register a connection in the `Connecting` state. The receiver yields
    /// serialized frames for the socket writer.
    pub fn connect(&self, principal: Option<Principal>) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut state = self.lock();
        state.next_connection += 1;
        state.total_connections += 1;
        let id = ConnectionId(state.next_connection);
        let now = Utc::now();
        state.connections.insert(
            id,
            Connection {
                state: ConnectionState::Connecting,
                principal,
                channels: HashSet::new(),
                outbound: tx,
                created_at: now,
                last_activity: now,
                messages_sent: 0,
                messages_received: 0,
            },
        );
        (id, rx)
    }

    /// `Connecting` to `Open`, then the welcome frame.
    pub fn accept(&self, id: ConnectionId) -> Result<(), HubError> {
        let principal = {
            let mut state = self.lock();
            let connection = state
                .connections
                .get_mut(&id)
                .ok_or(HubError::UnknownConnection(id))?;
            if connection.state != ConnectionState::Connecting {
                return Err(HubError::NotOpen(id));
            }
            connection.state = ConnectionState::Open;
            connection.principal.clone()
        };
        tracing::info!(connection = %id, principal = ?principal.as_ref().map(|p| &p.user_id), "connection opened");
        let welcome = OutboundMessage::new(
            "connection_established",
            json!({
                "connection_id": id.to_string(),
                "authenticated": principal.is_some(),
                "user_id": principal.map(|p| p.user_id),
                "channels": BUILTIN_CHANNELS,
            }),
        );
        if self.send(id, welcome) {
            Ok(())
        } else {
            Err(HubError::NotOpen(id))
        }
    }

    pub fn state_of(&self, id: ConnectionId) -> ConnectionState {
        self.lock()
            .connections
            .get(&id)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.state_of(id) == ConnectionState::Open
    }

    /// Send to one connection. A failed write disconnects it and returns
    /// `false`; it is never an error for the caller.
    pub fn send(&self, id: ConnectionId, mut message: OutboundMessage) -> bool {
        let mut state = self.lock();
        if !matches!(
            state.connections.get(&id).map(|c| c.state),
            Some(ConnectionState::Open)
        ) {
            return false;
        }
        state.stamp(&mut message);
        let frame = match serde_json::to_string(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(connection = %id, "failed to serialize {}: {e}", message.kind);
                return false;
            }
        };
        match state.write(id, &frame) {
            WriteOutcome::Sent => true,
            WriteOutcome::Dead => {
                state.remove(id);
                tracing::info!(connection = %id, "connection closed after failed write");
                false
            }
        }
    }

    /// Deliver to `channel`'s subscribers and to unfiltered connections, or
    /// to every open connection when `channel` is `None`. Returns the number
    /// of connections written to.
    pub fn broadcast(&self, message: OutboundMessage, channel: Option<&str>) -> usize {
        match channel {
            Some(channel) => self.broadcast_to(message, &[channel]),
            None => self.deliver(message, |_| true),
        }
    }

    /// Like [`broadcast`](Self::broadcast) for a message that belongs to
    /// several channels at once; each recipient gets it once.
    pub fn broadcast_to(&self, message: OutboundMessage, channels: &[&str]) -> usize {
        self.deliver(message, |c| c.wants(channels))
    }

    /// Deliver only to connections authenticated as `user_id`.
    pub fn send_to_principal(
        &self,
        user_id: &str,
        message: OutboundMessage,
        channels: &[&str],
    ) -> usize {
        self.deliver(message, |c| {
            c.principal.as_ref().map(|p| p.user_id == user_id).unwrap_or(false) && c.wants(channels)
        })
    }

    fn deliver(&self, message: OutboundMessage, select: impl Fn(&Connection) -> bool) -> usize {
        let mut state = self.lock();
        let targets: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Open && select(c))
            .map(|(id, _)| *id)
            .collect();
        let kind = message.kind.clone();
        match state.fan_out(message, targets) {
            Ok(delivered) => {
                tracing::trace!(kind = %kind, delivered, "broadcast");
                delivered
            }
            Err(e) => {
                tracing::error!("failed to serialize {kind}: {e}");
                0
            }
        }
    }

    pub fn subscribe(&self, id: ConnectionId, channel: &str) -> Result<(), HubError> {
        let subscriptions = {
            let mut state = self.lock();
            let connection = state
                .connections
                .get_mut(&id)
                .ok_or(HubError::UnknownConnection(id))?;
            if connection.state != ConnectionState::Open {
                return Err(HubError::NotOpen(id));
            }
            connection.channels.insert(channel.to_string());
            let subscriptions = sorted(&connection.channels);
            state
                .channels
                .entry(channel.to_string())
                .or_default()
                .insert(id);
            subscriptions
        };
        tracing::debug!(connection = %id, channel, "subscribed");
        self.send(
            id,
            OutboundMessage::new(
                "subscription_confirmed",
                json!({ "event_type": channel, "subscriptions": subscriptions }),
            ),
        );
        Ok(())
    }

    pub fn unsubscribe(&self, id: ConnectionId, channel: &str) -> Result<(), HubError> {
        let subscriptions = {
            let mut state = self.lock();
            let connection = state
                .connections
                .get_mut(&id)
                .ok_or(HubError::UnknownConnection(id))?;
            if connection.state != ConnectionState::Open {
                return Err(HubError::NotOpen(id));
            }
            connection.channels.remove(channel);
            let subscriptions = sorted(&connection.channels);
            if let Some(members) = state.channels.get_mut(channel) {
                members.remove(&id);
                if members.is_empty() {
                    state.channels.remove(channel);
                }
            }
            subscriptions
        };
        tracing::debug!(connection = %id, channel, "unsubscribed");
        self.send(
            id,
            OutboundMessage::new(
                "unsubscription_confirmed",
                json!({ "event_type": channel, "subscriptions": subscriptions }),
            ),
        );
        Ok(())
    }

    /// Open to closed. Returns `false` if the connection was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(id);
        if removed {
            tracing::info!(connection = %id, "connection closed");
        }
        removed
    }

    pub fn record_inbound(&self, id: ConnectionId) {
        if let Some(connection) = self.lock().connections.get_mut(&id) {
            connection.messages_received += 1;
            connection.last_activity = Utc::now();
        }
    }

    pub fn ping_all(&self) -> usize {
        self.broadcast(OutboundMessage::new("ping", json!({})), None)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().open_ids().count()
    }

    /// Subscribers of `channel`, excluding unfiltered connections.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        let state = self.lock();
        let mut ids: Vec<ConnectionId> = state
            .channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn connection_stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        let state = self.lock();
        state.connections.get(&id).map(|c| ConnectionStats {
            id,
            state: c.state,
            principal: c.principal.as_ref().map(|p| p.user_id.clone()),
            channels: sorted(&c.channels),
            messages_sent: c.messages_sent,
            messages_received: c.messages_received,
            created_at: c.created_at,
            last_activity: c.last_activity,
        })
    }

    pub fn stats(&self) -> HubStats {
        let state = self.lock();
        HubStats {
            active_connections: state.open_ids().count(),
            total_connections: state.total_connections,
            messages_sent: state.messages_sent,
            broadcasts: state.broadcasts,
            slow_consumer_disconnects: state.slow_consumer_disconnects,
            last_sequence: state.sequence,
            channels: state
                .channels
                .iter()
                .map(|(name, members)| (name.clone(), members.len()))
                .collect(),
        }
    }

    /// Spawn the periodic `ping` broadcast. No-op if already running.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.heartbeat.lock().expect("heartbeat mutex poisoned");
        if guard.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let hub = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let reached = hub.ping_all();
                tracing::trace!(reached, "heartbeat");
            }
        });
        *guard = Some(Heartbeat { cancel, handle });
    }

    pub async fn stop_heartbeat(&self) {
        let heartbeat = self.heartbeat.lock().expect("heartbeat mutex poisoned").take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel.cancel();
            let _ = heartbeat.handle.await;
        }
    }

    /// Close every connection; their writers see the queue end.
    pub fn close_all(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for id in &ids {
            state.remove(*id);
        }
        ids.len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_BUFFER)
    }
}

fn sorted(channels: &HashSet<String>) -> Vec<String> {
    let mut list: Vec<String> = channels.iter().cloned().collect();
    list.sort();
    list
}
