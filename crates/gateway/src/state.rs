use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    ccmux_config::CcmuxConfig,
    ccmux_orchestrator::SessionOrchestrator,
    tokio::sync::{RwLock, mpsc},
};

use crate::{auth::AuthGate, methods::MethodRegistry, tunnel::TunnelController};

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client currently connected to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    /// Channel feeding this client's write loop with serialized frames.
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
}

impl ConnectedClient {
    /// Send a serialized JSON frame to this client.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Monotonically increasing sequence counter for push events.
    pub seq: AtomicU64,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub config: CcmuxConfig,
    pub auth: AuthGate,
    pub tunnel: TunnelController,
    /// Client used by the reverse proxy for plain HTTP forwarding.
    pub http: reqwest::Client,
    pub version: String,
}

impl GatewayState {
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn register_client(&self, client: ConnectedClient) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client);
    }

    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    /// Send an event frame to a single client.
    pub async fn send_event_to(
        &self,
        conn_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> bool {
        let frame = ccmux_protocol::EventFrame::new(event, payload, self.next_seq());
        let Ok(json) = serde_json::to_string(&frame) else {
            return false;
        };
        match self.clients.read().await.get(conn_id) {
            Some(client) => client.send(&json),
            None => false,
        }
    }
}

/// Router state: the shared gateway plus the method registry.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
}
