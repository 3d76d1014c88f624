use std::sync::Arc;

use async_trait::async_trait;

use super::broadcast::{BroadcastHub, OutboundMessage};
use crate::bus::event_types::channels_for;
use crate::bus::{Event, EventHandler, EventType, HandlerError};

/// Global bus subscription that forwards every event to the hub, on the
/// channel(s) its type maps to.
pub struct HubRelay {
    hub: Arc<BroadcastHub>,
}

impl HubRelay {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }

    /// Returns the number of connections written to.
    pub fn relay(&self, event: &Event) -> usize {
        let channels = channels_for(event);
        let channels: Vec<&str> = channels.iter().map(String::as_str).collect();
        let message = OutboundMessage::new(event.event_type.as_str(), event.payload.clone())
            .with_timestamp(event.timestamp);

        match addressee(event) {
            Some(user_id) => self.hub.send_to_principal(user_id, message, &channels),
            None => self.hub.broadcast_to(message, &channels),
        }
    }
}

/// Notifications carrying a `user_id` are private to that principal.
fn addressee(event: &Event) -> Option<&str> {
    match event.event_type {
        EventType::Notification
        | EventType::NotificationUpdate
        | EventType::NotificationDismissed => event.payload.get("user_id")?.as_str(),
        _ => None,
    }
}

#[async_trait]
impl EventHandler for HubRelay {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let delivered = self.relay(event);
        tracing::trace!(event_type = %event.event_type, delivered, "relayed");
        Ok(())
    }

    fn name(&self) -> &str {
        "hub_relay"
    }
}
