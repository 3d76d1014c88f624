//! In-process event bus.
//!
//! Every producer publishes into one [`EventBus`]; every delivery mechanism
//! (the WebSocket hub included) subscribes from it.
//!
//! # Architecture
//!
//! Events flow from producer → `EventBus::publish` → priority lane → dispatch
//! loop → subscribed handlers:
//! - four bounded lanes (CRITICAL/HIGH/NORMAL/LOW), FIFO within a lane
//! - a full lane drops the event and counts it instead of blocking the producer
//! - handlers are isolated: errors, panics and timeouts are logged and counted
//! - a bounded ring of recent events backs `history`

mod event;
mod event_bus;
pub mod event_types;
mod lanes;
mod subscription;

pub use event::{Event, EventType, Priority};
pub use event_bus::{BusConfig, BusStats, EventBus, LaneDepths, SubscriptionHandle};
pub use subscription::{
    handler_fn, EventFilter, EventHandler, HandlerError, SubscriptionId, SubscriptionStats,
};
