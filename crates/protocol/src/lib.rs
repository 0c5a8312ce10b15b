//! Orchestrator WebSocket/RPC protocol definitions.
//!
//! All communication uses JSON frames over WebSocket.
//!
//! Frame types:
//! - `RequestFrame`  — client → server command
//! - `ResponseFrame` — server → client command result
//! - `EventFrame`    — server → client push event
//!
//! The event vocabulary (`events` module) and the projections carried in
//! `session:*` payloads are the wire contract consumed by the browser UI.

use serde::{Deserialize, Serialize};

pub mod bus;

pub use bus::BusEvent;

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s

/// Prefix for multiplexer window names owned by the orchestrator.
pub const WINDOW_PREFIX: &str = "ccm-";

/// Length of a session id (URL-safe, lowercase hex).
pub const SID_LEN: usize = 8;

/// Build the iframe URL a session is proxied under.
#[must_use]
pub fn session_url(sid: &str) -> String {
    format!("/t/{sid}/")
}

/// Build the window name for a session id.
#[must_use]
pub fn window_name(sid: &str) -> String {
    format!("{WINDOW_PREFIX}{sid}")
}

// ── Event names ──────────────────────────────────────────────────────────────

pub mod events {
    pub const REPOS_LIST: &str = "repos:list";
    pub const REPOS_SCANNING: &str = "repos:scanning";
    pub const REPOS_SCANNED: &str = "repos:scanned";
    pub const REPO_SET: &str = "repo:set";
    pub const REPO_ERROR: &str = "repo:error";

    pub const WORKTREE_LIST: &str = "worktree:list";
    pub const WORKTREE_CREATED: &str = "worktree:created";
    pub const WORKTREE_DELETED: &str = "worktree:deleted";
    pub const WORKTREE_ERROR: &str = "worktree:error";

    pub const SESSION_CREATED: &str = "session:created";
    pub const SESSION_RESTORED: &str = "session:restored";
    pub const SESSION_UPDATED: &str = "session:updated";
    pub const SESSION_STOPPED: &str = "session:stopped";
    pub const SESSION_ERROR: &str = "session:error";
    pub const SESSION_RESTORE_FAILED: &str = "session:restore_failed";

    pub const WINDOW_CREATED: &str = "window:created";
    pub const WINDOW_STOPPED: &str = "window:stopped";
    pub const GATEWAY_STOPPED: &str = "gateway:stopped";

    pub const TUNNEL_STARTED: &str = "tunnel:started";
    pub const TUNNEL_STOPPED: &str = "tunnel:stopped";
    pub const TUNNEL_CLOSE: &str = "tunnel:close";
    pub const TUNNEL_ERROR: &str = "tunnel:error";

    pub const PORTS_LIST: &str = "ports:list";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Gateway → client command result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
        }
    }
}

/// Discriminated union of all frame types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrameInner),
    #[serde(rename = "res")]
    Response(ResponseFrameInner),
    #[serde(rename = "event")]
    Event(EventFrameInner),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrameInner {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrameInner {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrameInner {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<ConnectQuery>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ConnectParams {
    /// The auth token provided in the handshake, from either location.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.auth
            .as_ref()
            .and_then(|a| a.token.as_deref())
            .or_else(|| self.query.as_ref().and_then(|q| q.token.as_deref()))
    }
}

/// Server info returned on a successful `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub r#type: String, // always "hello-ok"
    pub protocol: u32,
    pub version: String,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

// ── Projections ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Idle,
    Error,
    Stopped,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "active" => Some(Self::Active),
            "idle" => Some(Self::Idle),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full session projection carried in `session:created` / `session:updated`
/// / `session:restored` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub worktree_id: String,
    pub worktree_path: String,
    pub window_name: String,
    pub gateway_port: Option<u16>,
    pub status: SessionStatus,
    pub url: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    pub id: String,
    pub path: String,
    pub branch: String,
    pub commit: String,
    pub is_main: bool,
    pub is_bare: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    pub path: String,
    pub name: String,
    pub branch: String,
}

/// Ordered transcript entry for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub r#type: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_shape() {
        assert_eq!(session_url("a1b2c3d4"), "/t/a1b2c3d4/");
        assert_eq!(window_name("a1b2c3d4"), "ccm-a1b2c3d4");
    }

    #[test]
    fn request_frame_roundtrip() {
        let raw = r#"{"type":"req","id":"1","method":"session:start","params":{"worktreeId":"w1","worktreePath":"/tmp/r"}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        match frame {
            GatewayFrame::Request(req) => {
                assert_eq!(req.method, "session:start");
                assert_eq!(req.params.unwrap()["worktreePath"], "/tmp/r");
            },
            _ => panic!("expected request frame"),
        }
    }

    #[test]
    fn connect_params_token_prefers_auth() {
        let params: ConnectParams =
            serde_json::from_str(r#"{"auth":{"token":"a"},"query":{"token":"b"}}"#).unwrap();
        assert_eq!(params.token(), Some("a"));

        let params: ConnectParams = serde_json::from_str(r#"{"query":{"token":"b"}}"#).unwrap();
        assert_eq!(params.token(), Some("b"));

        let params: ConnectParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.token(), None);
    }

    #[test]
    fn session_serializes_camel_case() {
        let s = Session {
            id: "s1".into(),
            worktree_id: "w1".into(),
            worktree_path: "/tmp/r".into(),
            window_name: "ccm-s1".into(),
            gateway_port: Some(7681),
            status: SessionStatus::Active,
            url: "/t/s1/".into(),
            created_at: 0,
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["worktreePath"], "/tmp/r");
        assert_eq!(v["gatewayPort"], 7681);
        assert_eq!(v["status"], "active");
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in ["starting", "active", "idle", "error", "stopped"] {
            assert_eq!(SessionStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(SessionStatus::parse("bogus").is_none());
    }
}
