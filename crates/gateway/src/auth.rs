//! Auth gate: a startup token required for non-local traffic.
//!
//! The predicate runs on every non-static HTTP request and every socket
//! handshake. Local requests always pass; remote requests must present the
//! process-wide token via `?token=` or `X-Auth-Token` (HTTP), or the
//! `connect` handshake (socket).

use std::net::IpAddr;

use {
    axum::{
        body::Body,
        extract::State,
        http::{HeaderMap, Request, StatusCode, header},
        middleware::Next,
        response::{IntoResponse, Json, Response},
    },
    secrecy::{ExposeSecret, Secret},
};

use crate::state::AppState;

/// Generate the process-wide auth token: 128 random bits as hex.
#[must_use]
pub fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

// ── Locality ─────────────────────────────────────────────────────────────────

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Strip the port from a Host header value (IPv6 bracket form included).
fn host_name(host: &str) -> &str {
    if host.starts_with('[') {
        host.rsplit_once("]:")
            .map_or(host, |(addr, _)| addr)
            .trim_start_matches('[')
            .trim_end_matches(']')
    } else if host.matches(':').count() > 1 {
        // Bare IPv6 — no port stripping.
        host
    } else {
        host.rsplit_once(':').map_or(host, |(addr, _)| addr)
    }
}

/// Determine whether a request originated locally.
///
/// Local iff no `X-Forwarded-Host` is present, AND: when `X-Forwarded-For`
/// is present its first hop is a loopback or private address; otherwise the
/// `Host` header's hostname is a loopback name.
#[must_use]
pub fn is_request_local(headers: &HeaderMap) -> bool {
    if headers.contains_key("x-forwarded-host") {
        return false;
    }

    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        let first_hop = xff.split(',').next().unwrap_or("").trim();
        return first_hop
            .parse::<IpAddr>()
            .is_ok_and(is_private_ip);
    }

    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|host| matches!(host_name(host), "localhost" | "127.0.0.1" | "::1"))
}

// ── Static bypass ────────────────────────────────────────────────────────────

const STATIC_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "map", "html", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2",
    "ttf", "eot", "txt", "webmanifest",
];

/// True when the request path looks like a static asset.
#[must_use]
pub fn is_static_asset(path: &str) -> bool {
    if path.starts_with("/assets/") {
        return true;
    }
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

// ── Gate ─────────────────────────────────────────────────────────────────────

pub struct AuthGate {
    enabled: bool,
    token: Secret<String>,
}

impl AuthGate {
    pub fn new(enabled: bool, token: String) -> Self {
        Self {
            enabled,
            token: Secret::new(token),
        }
    }

    /// Gate disabled entirely (local-only deployments).
    pub fn disabled() -> Self {
        Self::new(false, String::new())
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The token value, for display at startup.
    #[must_use]
    pub fn token_for_display(&self) -> &str {
        self.token.expose_secret()
    }

    /// Constant-time token check. A missing token never matches.
    #[must_use]
    pub fn token_matches(&self, provided: Option<&str>) -> bool {
        match provided {
            Some(t) => safe_equal(t, self.token.expose_secret()),
            None => false,
        }
    }

    /// The full HTTP predicate: disabled → allow; static asset → allow;
    /// local → allow; otherwise the token decides.
    #[must_use]
    pub fn allow_http(
        &self,
        path: &str,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        if is_static_asset(path) {
            return true;
        }
        if is_request_local(headers) {
            return true;
        }
        let header_token = headers.get("x-auth-token").and_then(|v| v.to_str().ok());
        self.token_matches(query_token.or(header_token))
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.enabled)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Extract `token` from a raw query string.
#[must_use]
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(String::from)
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// HTTP middleware applying the auth gate to every route except the socket
/// endpoint, whose `connect` handshake enforces auth itself.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path == "/ws" {
        return next.run(request).await;
    }

    let query_token = token_from_query(request.uri().query());
    if state
        .gateway
        .auth
        .allow_http(&path, request.headers(), query_token.as_deref())
    {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "unauthorized" })),
    )
        .into_response()
}
