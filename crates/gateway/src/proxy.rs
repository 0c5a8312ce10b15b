//! Reverse proxy: `/t/<sid>/…` → `http://127.0.0.1:<gatewayPort>/…`.
//!
//! Plain requests are forwarded with hop-by-hop headers removed; upgrade
//! requests are bridged frame-for-frame to the upstream WebSocket. The
//! proxy only examines the URL, never the payload.

use {
    axum::{
        body::Body,
        extract::{
            FromRequestParts, Path, Request, State, WebSocketUpgrade,
            ws::{self, WebSocket},
        },
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
    },
    futures::{SinkExt, StreamExt},
    tokio_tungstenite::tungstenite,
    tracing::{debug, warn},
};

use crate::state::AppState;

/// Body bytes buffered when forwarding a plain request.
const MAX_FORWARD_BODY: usize = 64 * 1024 * 1024;

/// Headers that never cross the proxy (RFC 9110 hop-by-hop set).
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

/// Rewrite `/t/<sid>/<rest>?q` to the upstream path. An empty rest becomes
/// `/`.
fn upstream_path(rest: &str, query: Option<&str>) -> String {
    let mut path = if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{rest}")
    };
    if let Some(q) = query {
        path.push('?');
        path.push_str(q);
    }
    path
}

pub async fn proxy_root_handler(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    req: Request,
) -> Response {
    proxy(state, sid, String::new(), req).await
}

pub async fn proxy_handler(
    State(state): State<AppState>,
    Path((sid, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy(state, sid, rest, req).await
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn proxy(state: AppState, sid: String, rest: String, req: Request) -> Response {
    let Some(port) = state
        .gateway
        .orchestrator
        .get(&sid)
        .await
        .and_then(|s| s.gateway_port)
    else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let path = upstream_path(&rest, req.uri().query());

    if is_upgrade_request(req.headers()) {
        // Fail the handshake with 502 when the upstream is unreachable,
        // before committing to the upgrade.
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_err()
        {
            return (StatusCode::BAD_GATEWAY, "gateway unreachable").into_response();
        }
        let protocols = requested_protocols(req.headers());
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        let ws = if protocols.is_empty() {
            ws
        } else {
            ws.protocols(protocols)
        };
        return ws
            .on_upgrade(move |client| bridge_ws(client, sid, port, path))
            .into_response();
    }

    forward_http(&state, port, path, req).await
}

fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default()
}

// ── Plain HTTP forwarding ────────────────────────────────────────────────────

async fn forward_http(state: &AppState, port: u16, path: String, req: Request) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let url = format!("http://127.0.0.1:{port}{path}");

    let body = match axum::body::to_bytes(req.into_body(), MAX_FORWARD_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {e}"),
            )
                .into_response();
        },
    };

    let mut builder = state.gateway.http.request(method, &url);
    for (name, value) in &headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    let upstream = match builder.body(body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(url = %url, error = %e, "upstream unreachable");
            return (StatusCode::BAD_GATEWAY, "gateway unreachable").into_response();
        },
    };

    let status = upstream.status();
    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        response = response.header(name, value);
    }
    let stream = upstream.bytes_stream();
    response
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build proxied response");
            StatusCode::BAD_GATEWAY.into_response()
        })
}

// ── WebSocket bridging ───────────────────────────────────────────────────────

/// Bidirectionally copy frames between the client socket and the upstream
/// until either side closes.
async fn bridge_ws(client: WebSocket, sid: String, port: u16, path: String) {
    let url = format!("ws://127.0.0.1:{port}{path}");
    let (upstream, _resp) = match tokio_tungstenite::connect_async(&url).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(sid = %sid, url = %url, error = %e, "upstream ws handshake failed");
            let mut client = client;
            let _ = client
                .send(ws::Message::Close(Some(ws::CloseFrame {
                    code: 1014, // bad gateway
                    reason: "upstream handshake failed".into(),
                })))
                .await;
            return;
        },
    };
    debug!(sid = %sid, url = %url, "ws bridge established");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(msg)) => {
                    let Some(converted) = client_to_upstream(msg) else { continue };
                    let closing = matches!(converted, tungstenite::Message::Close(_));
                    if upstream_tx.send(converted).await.is_err() || closing {
                        break;
                    }
                },
                _ => {
                    let _ = upstream_tx.send(tungstenite::Message::Close(None)).await;
                    break;
                },
            },
            msg = upstream_rx.next() => match msg {
                Some(Ok(msg)) => {
                    let Some(converted) = upstream_to_client(msg) else { continue };
                    let closing = matches!(converted, ws::Message::Close(_));
                    if client_tx.send(converted).await.is_err() || closing {
                        break;
                    }
                },
                _ => {
                    let _ = client_tx.send(ws::Message::Close(None)).await;
                    break;
                },
            },
        }
    }
    debug!(sid = %sid, "ws bridge closed");
}

fn client_to_upstream(msg: ws::Message) -> Option<tungstenite::Message> {
    Some(match msg {
        ws::Message::Text(text) => tungstenite::Message::Text(text.as_str().into()),
        ws::Message::Binary(bytes) => tungstenite::Message::Binary(bytes),
        ws::Message::Ping(bytes) => tungstenite::Message::Ping(bytes),
        ws::Message::Pong(bytes) => tungstenite::Message::Pong(bytes),
        ws::Message::Close(frame) => {
            tungstenite::Message::Close(frame.map(|f| tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().to_string().into(),
            }))
        },
    })
}

fn upstream_to_client(msg: tungstenite::Message) -> Option<ws::Message> {
    Some(match msg {
        tungstenite::Message::Text(text) => ws::Message::Text(text.as_str().into()),
        tungstenite::Message::Binary(bytes) => ws::Message::Binary(bytes),
        tungstenite::Message::Ping(bytes) => ws::Message::Ping(bytes),
        tungstenite::Message::Pong(bytes) => ws::Message::Pong(bytes),
        tungstenite::Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
        // Raw frames never surface from a configured client.
        tungstenite::Message::Frame(_) => return None,
    })
}
