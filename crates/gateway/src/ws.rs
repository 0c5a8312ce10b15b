//! WebSocket connection lifecycle: handshake (with auth) → message loop →
//! cleanup.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use {
    axum::extract::ws::{Message, WebSocket},
    ccmux_protocol::{
        ConnectParams, ErrorShape, GatewayFrame, HANDSHAKE_TIMEOUT_MS, HelloOk, MAX_PAYLOAD_BYTES,
        PROTOCOL_VERSION, ResponseFrame, events,
    },
    futures::{SinkExt, stream::StreamExt},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    methods::{MethodContext, MethodRegistry},
    state::{ConnectedClient, GatewayState},
};

/// Handle a single WebSocket connection through its full lifecycle.
///
/// `header_authenticated` is true when the upgrade request already passed
/// the gate (local origin or a valid query token); otherwise the `connect`
/// frame must carry the token.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
    header_authenticated: bool,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, remote = %remote_addr, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    // Write loop: forwards frames from the client channel to the socket.
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    // ── Handshake phase ──────────────────────────────────────────────────

    let connect_result = match tokio::time::timeout(
        std::time::Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        wait_for_connect(&mut ws_rx),
    )
    .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(conn_id = %conn_id, error = %e, "ws: handshake failed");
            drop(client_tx);
            write_handle.abort();
            return;
        },
        Err(_) => {
            warn!(conn_id = %conn_id, "ws: handshake timeout");
            drop(client_tx);
            write_handle.abort();
            return;
        },
    };

    let (request_id, params) = connect_result;

    // ── Auth ─────────────────────────────────────────────────────────────

    let authenticated = !state.auth.enabled()
        || header_authenticated
        || state.auth.token_matches(params.token());

    if !authenticated {
        warn!(conn_id = %conn_id, "ws: auth failed");
        let err = ResponseFrame::err(
            &request_id,
            ErrorShape::new("UNAUTHORIZED", "authentication failed"),
        );
        if let Ok(json) = serde_json::to_string(&err) {
            let _ = client_tx.send(json);
        }
        drop(client_tx);
        write_handle.abort();
        return;
    }

    let hello = HelloOk {
        r#type: "hello-ok".into(),
        protocol: PROTOCOL_VERSION,
        version: state.version.clone(),
        conn_id: conn_id.clone(),
    };
    let resp = ResponseFrame::ok(&request_id, serde_json::to_value(&hello).unwrap_or_default());
    if let Ok(json) = serde_json::to_string(&resp) {
        let _ = client_tx.send(json);
    }

    info!(conn_id = %conn_id, "ws: handshake complete");

    state
        .register_client(ConnectedClient {
            conn_id: conn_id.clone(),
            sender: client_tx.clone(),
            connected_at: Instant::now(),
        })
        .await;

    // Initial snapshot: the allow-listed repositories, if any.
    state
        .send_event_to(
            &conn_id,
            events::REPOS_LIST,
            serde_json::json!({ "repos": state.config.repos.allowed }),
        )
        .await;

    // ── Message loop ─────────────────────────────────────────────────────

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(conn_id = %conn_id, size = text.len(), "ws: payload too large");
            state
                .send_event_to(
                    &conn_id,
                    "error",
                    serde_json::json!({
                        "message": "payload too large",
                        "maxBytes": MAX_PAYLOAD_BYTES,
                    }),
                )
                .await;
            continue;
        }

        let frame: GatewayFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: invalid frame");
                state
                    .send_event_to(
                        &conn_id,
                        "error",
                        serde_json::json!({ "message": "invalid frame" }),
                    )
                    .await;
                continue;
            },
        };

        match frame {
            GatewayFrame::Request(req) => {
                let ctx = MethodContext {
                    request_id: req.id.clone(),
                    method: req.method.clone(),
                    params: req.params.unwrap_or(serde_json::Value::Null),
                    conn_id: conn_id.clone(),
                    state: Arc::clone(&state),
                };
                let response = methods.dispatch(ctx).await;
                if let Ok(json) = serde_json::to_string(&response) {
                    let _ = client_tx.send(json);
                }
            },
            _ => {
                debug!(conn_id = %conn_id, "ws: ignoring non-request frame");
            },
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    let duration = state
        .remove_client(&conn_id)
        .await
        .map(|c| c.connected_at.elapsed())
        .unwrap_or_default();
    info!(
        conn_id = %conn_id,
        duration_secs = duration.as_secs(),
        "ws: connection closed"
    );

    drop(client_tx);
    write_handle.abort();
}

/// Wait for the first `connect` request frame.
async fn wait_for_connect(
    rx: &mut futures::stream::SplitStream<WebSocket>,
) -> anyhow::Result<(String, ConnectParams)> {
    while let Some(msg) = rx.next().await {
        let text = match msg? {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => anyhow::bail!("connection closed before handshake"),
            _ => continue,
        };

        let frame: GatewayFrame = serde_json::from_str(&text)?;
        match frame {
            GatewayFrame::Request(req) => {
                if req.method != "connect" {
                    anyhow::bail!("first message must be 'connect', got '{}'", req.method);
                }
                let params: ConnectParams =
                    serde_json::from_value(req.params.unwrap_or(serde_json::Value::Null))?;
                return Ok((req.id, params));
            },
            _ => anyhow::bail!("first message must be a request frame"),
        }
    }
    anyhow::bail!("connection closed before handshake")
}
