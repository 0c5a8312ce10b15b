#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests booting the real router on a loopback listener.
//!
//! Tests that need live sessions run against a throwaway tmux server and a
//! scripted ttyd stand-in, and skip when tmux is not installed.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use {
    axum::{
        body::Bytes,
        extract::WebSocketUpgrade,
        http::HeaderMap,
        response::IntoResponse,
        routing::{any, get},
    },
    ccmux_config::CcmuxConfig,
    ccmux_gateway::{
        auth::AuthGate,
        broadcast::spawn_bus_pump,
        methods::{MethodContext, MethodRegistry},
        server::build_app,
        state::GatewayState,
        tunnel::TunnelController,
    },
    ccmux_orchestrator::SessionOrchestrator,
    ccmux_registry::SessionRegistry,
    ccmux_terminal::TmuxSupervisor,
    ccmux_webterm::{PortAllocator, TtydSupervisor},
    futures::{SinkExt, StreamExt},
    tokio::{net::TcpListener, sync::mpsc},
    tokio_tungstenite::tungstenite::{self, client::IntoClientRequest},
};

const TEST_TOKEN: &str = "cafebabecafebabecafebabecafebabe";

struct TestServer {
    socket: String,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = std::process::Command::new("tmux")
            .args(["-L", &self.socket, "kill-server"])
            .output();
    }
}

fn fake_ttyd(dir: &tempfile::TempDir) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("fake-ttyd");
    std::fs::write(&path, "#!/bin/sh\necho 'Listening on port' >&2\nsleep 60\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct TestGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    _tmux: TestServer,
}

async fn boot(
    tag: &str,
    auth_enabled: bool,
    allowed_repos: Vec<String>,
    ports: (u16, u16),
    ttyd_dir: &tempfile::TempDir,
) -> TestGateway {
    let tmux = TestServer {
        socket: format!("ccmux-gw-{tag}-{}", std::process::id()),
    };
    let (bus_tx, bus_rx) = mpsc::unbounded_channel();

    let terminal = Arc::new(TmuxSupervisor::new(
        None,
        tmux.socket.clone(),
        "",
        bus_tx.clone(),
    ));
    let webterm = Arc::new(
        TtydSupervisor::new(
            Some(fake_ttyd(ttyd_dir).display().to_string()),
            None,
            tmux.socket.clone(),
            None,
            PortAllocator::new(ports.0, ports.1),
            bus_tx.clone(),
        )
        .with_ready_timeout(Duration::from_millis(500)),
    );
    let registry = SessionRegistry::in_memory().await.unwrap();
    let orchestrator = Arc::new(
        SessionOrchestrator::new(terminal, webterm, registry, bus_tx.clone())
            .await
            .unwrap(),
    );

    let mut config = CcmuxConfig::default();
    config.repos.allowed = allowed_repos;
    config.webterm.start_port = ports.0;
    config.webterm.max_port = ports.1;

    let state = Arc::new(GatewayState {
        clients: Default::default(),
        seq: Default::default(),
        orchestrator,
        config,
        auth: if auth_enabled {
            AuthGate::new(true, TEST_TOKEN.into())
        } else {
            AuthGate::disabled()
        },
        tunnel: TunnelController::new(
            Some("cloudflared-definitely-missing".into()),
            Default::default(),
            bus_tx.clone(),
        ),
        http: reqwest::Client::new(),
        version: "test".into(),
    });
    spawn_bus_pump(Arc::clone(&state), bus_rx);

    let app = build_app(Arc::clone(&state), Arc::new(MethodRegistry::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway {
        addr,
        state,
        _tmux: tmux,
    }
}

fn tmux_missing() -> bool {
    which::which("tmux").is_err()
}

// ── Auth gate ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn auth_gate_token_and_locality() {
    let bins = tempfile::tempdir().unwrap();
    let gw = boot("auth", true, vec![], (9300, 9301), &bins).await;
    let base = format!("http://{}", gw.addr);
    let client = reqwest::Client::new();

    // Local request (loopback Host, no forwarding headers) passes.
    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    // Forwarded (remote-looking) request without a token is rejected.
    let resp = client
        .get(format!("{base}/health"))
        .header("x-forwarded-host", "public.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Same request with the token in the query passes.
    let resp = client
        .get(format!("{base}/health?token={TEST_TOKEN}"))
        .header("x-forwarded-host", "public.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Token in the header works too.
    let resp = client
        .get(format!("{base}/health"))
        .header("x-forwarded-host", "public.example.com")
        .header("x-auth-token", TEST_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Wrong token stays rejected.
    let resp = client
        .get(format!("{base}/health?token=wrong"))
        .header("x-forwarded-host", "public.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn proxy_unknown_session_is_404() {
    let bins = tempfile::tempdir().unwrap();
    let gw = boot("p404", false, vec![], (9310, 9311), &bins).await;
    let resp = reqwest::get(format!("http://{}/t/NOPE/", gw.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ── Socket handshake ─────────────────────────────────────────────────────────

async fn ws_connect_with_auth(
    addr: SocketAddr,
    forwarded: bool,
    token: Option<&str>,
) -> serde_json::Value {
    let url = format!("ws://{addr}/ws");
    let mut request = url.into_client_request().unwrap();
    if forwarded {
        request
            .headers_mut()
            .insert("x-forwarded-host", "public.example.com".parse().unwrap());
    }
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let params = match token {
        Some(t) => serde_json::json!({ "auth": { "token": t } }),
        None => serde_json::json!({}),
    };
    let connect = serde_json::json!({
        "type": "req", "id": "1", "method": "connect", "params": params,
    });
    ws.send(tungstenite::Message::Text(connect.to_string().into()))
        .await
        .unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    serde_json::from_str(reply.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn socket_handshake_enforces_token_for_remote() {
    let bins = tempfile::tempdir().unwrap();
    let gw = boot("wsauth", true, vec![], (9320, 9321), &bins).await;

    // Remote-looking upgrade without a token fails the handshake.
    let reply = ws_connect_with_auth(gw.addr, true, None).await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "UNAUTHORIZED");

    // With the token it completes and the repos snapshot follows.
    let reply = ws_connect_with_auth(gw.addr, true, Some(TEST_TOKEN)).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["payload"]["type"], "hello-ok");

    // Local upgrades skip the token entirely.
    let reply = ws_connect_with_auth(gw.addr, false, None).await;
    assert_eq!(reply["ok"], true);
}

#[tokio::test]
async fn connected_client_receives_repos_snapshot_and_allowlist_errors() {
    let bins = tempfile::tempdir().unwrap();
    let gw = boot(
        "allow",
        false,
        vec!["/srv/a".into(), "/srv/b".into()],
        (9330, 9331),
        &bins,
    )
    .await;

    let url = format!("ws://{}/ws", gw.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let connect = serde_json::json!({
        "type": "req", "id": "1", "method": "connect", "params": {},
    });
    ws.send(tungstenite::Message::Text(connect.to_string().into()))
        .await
        .unwrap();

    // hello-ok, then the repos:list snapshot.
    let hello: serde_json::Value =
        serde_json::from_str(ws.next().await.unwrap().unwrap().to_text().unwrap()).unwrap();
    assert_eq!(hello["ok"], true);
    let snapshot: serde_json::Value =
        serde_json::from_str(ws.next().await.unwrap().unwrap().to_text().unwrap()).unwrap();
    assert_eq!(snapshot["event"], "repos:list");
    assert_eq!(snapshot["payload"]["repos"][0], "/srv/a");

    // Selecting a repo outside the allow-list is rejected.
    let select = serde_json::json!({
        "type": "req", "id": "2", "method": "repo:select", "params": { "path": "/srv/c" },
    });
    ws.send(tungstenite::Message::Text(select.to_string().into()))
        .await
        .unwrap();

    let mut saw_repo_error = false;
    let mut saw_rejection = false;
    for _ in 0..2 {
        let frame: serde_json::Value =
            serde_json::from_str(ws.next().await.unwrap().unwrap().to_text().unwrap()).unwrap();
        if frame["type"] == "event" && frame["event"] == "repo:error" {
            saw_repo_error = true;
        }
        if frame["type"] == "res" && frame["id"] == "2" {
            assert_eq!(frame["ok"], false);
            saw_rejection = true;
        }
    }
    assert!(saw_repo_error && saw_rejection);
}

// ── Proxy transparency (requires tmux) ───────────────────────────────────────

/// Upstream stand-in for a ttyd instance: echoes bodies and WS frames.
async fn start_upstream() -> SocketAddr {
    async fn echo(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
        let marker = headers
            .get("x-probe")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        ([("x-upstream", marker)], body)
    }

    let app = axum::Router::new()
        .route("/echo", any(echo))
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async {
                ws.on_upgrade(|mut socket| async move {
                    while let Some(Ok(msg)) = socket.recv().await {
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                })
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn proxy_is_transparent_for_http_and_ws() {
    if tmux_missing() {
        return; // requires tmux
    }
    let upstream = start_upstream().await;
    let port = upstream.port();

    let bins = tempfile::tempdir().unwrap();
    let worktree = tempfile::tempdir().unwrap();
    // The allocator range is exactly the upstream port, so the session's
    // gateway port points at the echo server.
    let gw = boot("proxy", false, vec![], (port, port), &bins).await;

    let session = gw
        .state
        .orchestrator
        .start("w1", &worktree.path().display().to_string())
        .await
        .unwrap();
    assert_eq!(session.gateway_port, Some(port));

    let client = reqwest::Client::new();
    let direct = client
        .post(format!("http://127.0.0.1:{port}/echo?x=1"))
        .header("x-probe", "p1")
        .body("round trip payload")
        .send()
        .await
        .unwrap();
    let proxied = client
        .post(format!("http://{}/t/{}/echo?x=1", gw.addr, session.id))
        .header("x-probe", "p1")
        .body("round trip payload")
        .send()
        .await
        .unwrap();

    assert_eq!(direct.status(), proxied.status());
    assert_eq!(
        direct.headers().get("x-upstream"),
        proxied.headers().get("x-upstream")
    );
    let direct_body = direct.bytes().await.unwrap();
    let proxied_body = proxied.bytes().await.unwrap();
    assert_eq!(direct_body, proxied_body);

    // Root path rewrite: /t/<sid>/ → / upstream (404 from the echo router,
    // but proxied rather than rejected).
    let resp = client
        .get(format!("http://{}/t/{}/", gw.addr, session.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // WebSocket upgrade through the proxy echoes round-trip.
    let url = format!("ws://{}/t/{}/ws", gw.addr, session.id);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(tungstenite::Message::Text("ping me".into()))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed.to_text().unwrap(), "ping me");
    ws.send(tungstenite::Message::Binary(vec![1u8, 2, 3].into()))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert!(matches!(echoed, tungstenite::Message::Binary(b) if b.as_ref() == [1, 2, 3]));

    gw.state.orchestrator.stop(&session.id).await.unwrap();
}

#[tokio::test]
async fn proxy_returns_502_when_gateway_is_unreachable() {
    if tmux_missing() {
        return; // requires tmux
    }
    // Reserve a port, then free it so nothing listens there.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let bins = tempfile::tempdir().unwrap();
    let worktree = tempfile::tempdir().unwrap();
    let gw = boot("p502", false, vec![], (dead_port, dead_port), &bins).await;

    let session = gw
        .state
        .orchestrator
        .start("w1", &worktree.path().display().to_string())
        .await
        .unwrap();

    let resp = reqwest::get(format!("http://{}/t/{}/anything", gw.addr, session.id))
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    gw.state.orchestrator.stop(&session.id).await.unwrap();
}

// ── Worktree delete with a live session (requires tmux + git) ────────────────

#[tokio::test]
async fn worktree_delete_stops_the_bound_session_first() {
    if tmux_missing() {
        return; // requires tmux
    }

    // Scratch git repository with one linked worktree.
    let repo = tempfile::tempdir().unwrap();
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "t@t"],
        vec!["config", "user.name", "t"],
        vec!["commit", "--allow-empty", "-m", "init"],
    ] {
        std::process::Command::new("git")
            .args(&args)
            .current_dir(repo.path())
            .output()
            .unwrap();
    }
    let repo_path = repo.path().display().to_string();
    let worktree = ccmux_worktrees::WorktreeService::create(&repo_path, "feat/x", None)
        .await
        .unwrap();
    assert!(worktree.path.ends_with("-feat-x"));

    let bins = tempfile::tempdir().unwrap();
    let gw = boot("wtdel", false, vec![], (9340, 9345), &bins).await;

    let session = gw
        .state
        .orchestrator
        .start(&worktree.id, &worktree.path)
        .await
        .unwrap();
    assert!(gw.state.orchestrator.get(&session.id).await.is_some());

    // Dispatch the delete command the way the socket layer would.
    let registry = MethodRegistry::new();
    let ctx = MethodContext {
        request_id: "1".into(),
        method: "worktree:delete".into(),
        params: serde_json::json!({
            "repoPath": repo_path,
            "worktreePath": worktree.path,
        }),
        conn_id: "test".into(),
        state: Arc::clone(&gw.state),
    };
    let response = registry.dispatch(ctx).await;
    assert!(response.ok, "delete failed: {:?}", response.error);

    // The session was stopped and deleted, and the worktree is gone.
    assert!(gw.state.orchestrator.get(&session.id).await.is_none());
    assert!(
        gw.state
            .orchestrator
            .registry()
            .get_by_id(&session.id)
            .await
            .unwrap()
            .is_none()
    );
    let list = ccmux_worktrees::WorktreeService::list(&repo_path).await.unwrap();
    assert!(!list.iter().any(|w| w.path == worktree.path));
}
