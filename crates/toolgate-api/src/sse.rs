//! SSE Fan-out (C10): streams the event bus to HTTP clients, filtered by
//! the `types` and `servers` query parameters.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::StreamExt;
use uuid::Uuid;

use toolgate_core::Envelope;

use crate::state::GatewayServices;

const KEEPALIVE_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub servers: Option<String>,
}

impl EventFilter {
    fn wanted_types(&self) -> Option<Vec<String>> {
        self.types
            .as_ref()
            .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
    }

    fn wanted_servers(&self) -> Option<Vec<Uuid>> {
        self.servers
            .as_ref()
            .map(|s| s.split(',').filter_map(|id| id.trim().parse().ok()).collect())
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(types) = self.wanted_types() {
            if !types.iter().any(|t| t == envelope.event.type_name()) {
                return false;
            }
        }
        if let Some(servers) = self.wanted_servers() {
            match envelope.event.server_id() {
                Some(id) if servers.contains(&id) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Strips the `type`/`emitted_at` tags out of the serialized envelope so the
/// `data:` payload carries only the event's own fields; `type` is already
/// the SSE `event:` line and `emitted_at` becomes the `id:` line.
fn event_data(envelope: &Envelope) -> Value {
    let mut value = serde_json::to_value(envelope).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("type");
        map.remove("emitted_at");
        map.remove("id");
    }
    value
}

fn envelope_to_sse_event(envelope: &Envelope) -> Event {
    let id = format!("{}-{}", envelope.event.type_name(), envelope.emitted_at.timestamp_millis());
    Event::default()
        .id(id)
        .event(envelope.event.type_name())
        .json_data(event_data(envelope))
        .unwrap_or_else(|_| Event::default().event("error").data("failed to encode event"))
}

fn connected_event() -> Event {
    Event::default().event("connected").data("{}")
}

fn keepalive_event() -> Event {
    Event::default()
        .event("keepalive")
        .data(serde_json::json!({ "timestamp": chrono::Utc::now().to_rfc3339() }).to_string())
}

pub async fn sse_handler(
    State(services): State<Arc<GatewayServices>>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = services.events.subscribe();
    let events = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(envelope) if filter.matches(&envelope) => Some(Ok(envelope_to_sse_event(&envelope))),
        Ok(_) => None,
        Err(_) => None,
    });

    let keepalive = IntervalStream::new(tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS)))
        .skip(1)
        .map(|_| Ok(keepalive_event()));

    let initial = stream::once(async { Ok(connected_event()) });

    Sse::new(initial.chain(events.merge(keepalive)))
}
