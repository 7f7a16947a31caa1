//! Event Bus (C8): typed pub/sub fed by every other component, consumed by
//! the SSE fan-out and the webhook dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    ServerConnected { server_id: Uuid, server_name: String },
    ServerDisconnected { server_id: Uuid, server_name: String },
    ServerError { server_id: Uuid, server_name: String, message: String },
    ServerCreated { server_id: Uuid, server_name: String },
    ServerUpdated { server_id: Uuid, server_name: String },
    ServerDeleted { server_id: Uuid, server_name: String },
    ToolInvoked {
        qualified_name: String,
        server_id: Uuid,
        duration_ms: u64,
        cache_hit: bool,
    },
    ToolError {
        qualified_name: String,
        server_id: Uuid,
        message: String,
    },
    CircuitOpened { server_id: Uuid },
    CircuitClosed { server_id: Uuid },
    CircuitHalfOpen { server_id: Uuid },
}

impl GatewayEvent {
    /// The `types` filter value used by `/sse/events?types=`.
    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayEvent::ServerConnected { .. } => "server.connected",
            GatewayEvent::ServerDisconnected { .. } => "server.disconnected",
            GatewayEvent::ServerError { .. } => "server.error",
            GatewayEvent::ServerCreated { .. } => "server.created",
            GatewayEvent::ServerUpdated { .. } => "server.updated",
            GatewayEvent::ServerDeleted { .. } => "server.deleted",
            GatewayEvent::ToolInvoked { .. } => "tool.invoked",
            GatewayEvent::ToolError { .. } => "tool.error",
            GatewayEvent::CircuitOpened { .. } => "circuit.opened",
            GatewayEvent::CircuitClosed { .. } => "circuit.closed",
            GatewayEvent::CircuitHalfOpen { .. } => "circuit.half_open",
        }
    }

    /// The server this event concerns, when there is one, for the
    /// `servers=` SSE filter.
    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            GatewayEvent::ServerConnected { server_id, .. }
            | GatewayEvent::ServerDisconnected { server_id, .. }
            | GatewayEvent::ServerError { server_id, .. }
            | GatewayEvent::ServerCreated { server_id, .. }
            | GatewayEvent::ServerUpdated { server_id, .. }
            | GatewayEvent::ServerDeleted { server_id, .. }
            | GatewayEvent::ToolInvoked { server_id, .. }
            | GatewayEvent::ToolError { server_id, .. }
            | GatewayEvent::CircuitOpened { server_id }
            | GatewayEvent::CircuitClosed { server_id }
            | GatewayEvent::CircuitHalfOpen { server_id } => Some(*server_id),
        }
    }
}

/// An event plus the timestamp it was emitted at, what subscribers actually
/// receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GatewayEvent,
}

/// Broadcast-backed pub/sub. Lagging subscribers drop the oldest events
/// rather than block publishers; `subscribe` returns a fresh receiver that
/// only sees events emitted after it was created.
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: GatewayEvent) {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            event,
        };
        // No subscribers is not an error: nothing is listening yet.
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
