//! Typed event bus payloads.
//!
//! Supervisors and the orchestrator push `BusEvent`s into an unbounded
//! channel; the gateway pumps them out to every connected client. Events for
//! one session id are produced under that session's lock, so each subscriber
//! observes them in production order.

use serde_json::json;

use crate::{Session, events};

#[derive(Debug, Clone)]
pub enum BusEvent {
    WindowCreated { sid: String, window_name: String },
    WindowStopped { sid: String },
    GatewayStopped { sid: String, port: u16 },
    SessionCreated(Session),
    SessionRestored(Session),
    SessionUpdated(Session),
    SessionStopped { sid: String },
    SessionError { sid: Option<String>, message: String },
    TunnelStarted { url: String },
    TunnelStopped,
    TunnelClosed,
}

impl BusEvent {
    /// Wire event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::WindowCreated { .. } => events::WINDOW_CREATED,
            Self::WindowStopped { .. } => events::WINDOW_STOPPED,
            Self::GatewayStopped { .. } => events::GATEWAY_STOPPED,
            Self::SessionCreated(_) => events::SESSION_CREATED,
            Self::SessionRestored(_) => events::SESSION_RESTORED,
            Self::SessionUpdated(_) => events::SESSION_UPDATED,
            Self::SessionStopped { .. } => events::SESSION_STOPPED,
            Self::SessionError { .. } => events::SESSION_ERROR,
            Self::TunnelStarted { .. } => events::TUNNEL_STARTED,
            Self::TunnelStopped => events::TUNNEL_STOPPED,
            Self::TunnelClosed => events::TUNNEL_CLOSE,
        }
    }

    /// JSON payload as delivered to clients.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::WindowCreated { sid, window_name } => {
                json!({ "sid": sid, "windowName": window_name })
            },
            Self::WindowStopped { sid } => json!({ "sid": sid }),
            Self::GatewayStopped { sid, port } => json!({ "sid": sid, "port": port }),
            Self::SessionCreated(s) | Self::SessionRestored(s) | Self::SessionUpdated(s) => {
                serde_json::to_value(s).unwrap_or_default()
            },
            Self::SessionStopped { sid } => json!(sid),
            Self::SessionError { sid, message } => json!({ "sid": sid, "message": message }),
            Self::TunnelStarted { url } => json!({ "url": url }),
            Self::TunnelStopped | Self::TunnelClosed => json!({}),
        }
    }

    /// The session id this event concerns, when any.
    #[must_use]
    pub fn sid(&self) -> Option<&str> {
        match self {
            Self::WindowCreated { sid, .. }
            | Self::WindowStopped { sid }
            | Self::GatewayStopped { sid, .. }
            | Self::SessionStopped { sid } => Some(sid),
            Self::SessionCreated(s) | Self::SessionRestored(s) | Self::SessionUpdated(s) => {
                Some(&s.id)
            },
            Self::SessionError { sid, .. } => sid.as_deref(),
            _ => None,
        }
    }
}
