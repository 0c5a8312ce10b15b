//! Event fan-out to connected WebSocket clients, and the pump draining the
//! typed bus.

use std::sync::Arc;

use {
    ccmux_protocol::{BusEvent, EventFrame, events},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use crate::state::GatewayState;

/// Broadcast an event to every connected client. Closed clients are skipped;
/// per-client channels are unbounded, so ordering per event source is
/// preserved.
pub async fn broadcast(state: &Arc<GatewayState>, event: &str, payload: serde_json::Value) {
    let frame = EventFrame::new(event, payload, state.next_seq());
    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(event, error = %e, "failed to serialize event");
            return;
        },
    };

    let clients = state.clients.read().await;
    debug!(event, clients = clients.len(), "broadcasting event");
    for client in clients.values() {
        if !client.send(&json) {
            debug!(conn_id = %client.conn_id, "dropping event for closed client");
        }
    }
}

/// Drain the typed bus and fan events out to clients.
///
/// `session:*` and `tunnel:*` events go to every client. Supervisor-internal
/// events (`window:*`, `gateway:*`) stay internal; a dead gateway instead
/// surfaces as a refreshed `session:updated` projection with its port
/// cleared.
pub fn spawn_bus_pump(
    state: Arc<GatewayState>,
    mut rx: mpsc::UnboundedReceiver<BusEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &event {
                BusEvent::WindowCreated { sid, .. } | BusEvent::WindowStopped { sid } => {
                    debug!(sid = %sid, event = event.name(), "window lifecycle");
                },
                BusEvent::GatewayStopped { sid, port } => {
                    debug!(sid = %sid, port, "gateway exited");
                    if let Some(session) = state.orchestrator.get(sid).await {
                        broadcast(
                            &state,
                            events::SESSION_UPDATED,
                            serde_json::to_value(&session).unwrap_or_default(),
                        )
                        .await;
                    }
                },
                _ => broadcast(&state, event.name(), event.payload()).await,
            }
        }
        debug!("event bus closed");
    })
}
