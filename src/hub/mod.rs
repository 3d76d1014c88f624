//! Client delivery.
//!
//! [`BroadcastHub`] owns the live connections and their channel sets,
//! [`HubRelay`] feeds it from the bus, and [`ws`] exposes it over WebSocket.

pub mod auth;
mod broadcast;
pub mod protocol;
mod relay;
pub mod ws;

pub use auth::{extract_token, AllowAnonymous, Principal, StaticTokenVerifier, TokenVerifier};
pub use broadcast::{
    BroadcastHub, ConnectionId, ConnectionState, ConnectionStats, HubError, HubStats,
    OutboundMessage, DEFAULT_CONNECTION_BUFFER, DEFAULT_HEARTBEAT,
};
pub use protocol::{ControlPlane, ErrorCode};
pub use relay::HubRelay;
pub use ws::{router, WsContext};
