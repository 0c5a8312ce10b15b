//! Router assembly and gateway startup.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, RawQuery, State, WebSocketUpgrade},
        http::HeaderMap,
        response::{IntoResponse, Json},
        routing::{any, get},
    },
    ccmux_config::CcmuxConfig,
    ccmux_orchestrator::SessionOrchestrator,
    ccmux_registry::SessionRegistry,
    ccmux_terminal::TmuxSupervisor,
    ccmux_webterm::{PortAllocator, TtydSupervisor},
    tokio::{net::TcpListener, sync::mpsc},
    tower_http::cors::{Any, CorsLayer},
    tracing::{info, warn},
};

use crate::{
    assets, auth,
    auth::AuthGate,
    broadcast::spawn_bus_pump,
    methods::MethodRegistry,
    proxy,
    state::{AppState, GatewayState},
    tunnel::TunnelController,
    ws::handle_connection,
};

/// Build the gateway router (shared between production startup and tests).
pub fn build_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app_state = AppState {
        gateway: state,
        methods,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/t/{sid}/", any(proxy::proxy_root_handler))
        .route("/t/{sid}/{*rest}", any(proxy::proxy_handler))
        .route("/assets/{*path}", get(assets::asset_handler))
        .fallback(assets::spa_fallback)
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            auth::require_auth,
        ))
        .layer(cors)
        .with_state(app_state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "ccmux",
        "version": state.gateway.version,
    }))
}

async fn ws_upgrade_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let gate = &state.gateway.auth;
    let query_token = auth::token_from_query(query.as_deref());
    let header_authenticated = !gate.enabled()
        || auth::is_request_local(&headers)
        || gate.token_matches(query_token.as_deref());

    let gateway = Arc::clone(&state.gateway);
    let methods = Arc::clone(&state.methods);
    ws.on_upgrade(move |socket| {
        handle_connection(socket, gateway, methods, addr, header_authenticated)
    })
}

/// Wire the supervisors, registry, orchestrator, and event bus into a
/// ready-to-serve state.
pub async fn build_state(config: CcmuxConfig, version: &str) -> anyhow::Result<Arc<GatewayState>> {
    ccmux_config::ensure_runtime_dirs(&config)?;

    let (bus_tx, bus_rx) = mpsc::unbounded_channel();

    let terminal = Arc::new(TmuxSupervisor::new(
        config.binaries.tmux.clone(),
        ccmux_terminal::DEFAULT_SOCKET,
        config.binaries.agent.clone(),
        bus_tx.clone(),
    ));
    let webterm = Arc::new(TtydSupervisor::new(
        config.binaries.ttyd.clone(),
        config.binaries.tmux.clone(),
        ccmux_terminal::DEFAULT_SOCKET,
        config.webterm.theme.clone(),
        PortAllocator::new(config.webterm.start_port, config.webterm.max_port),
        bus_tx.clone(),
    ));

    let db_path = ccmux_config::data_dir(&config).join("sessions.db");
    let registry = SessionRegistry::open(&db_path).await?;

    let orchestrator = Arc::new(
        SessionOrchestrator::new(terminal, webterm, registry, bus_tx.clone()).await?,
    );

    let tunnel = TunnelController::new(
        config.binaries.cloudflared.clone(),
        config.tunnel.clone(),
        bus_tx.clone(),
    );

    let gate = if config.auth.enabled {
        let token = auth::generate_token();
        info!("auth token: {token}");
        AuthGate::new(true, token)
    } else {
        AuthGate::disabled()
    };

    let state = Arc::new(GatewayState {
        clients: Default::default(),
        seq: Default::default(),
        orchestrator,
        config,
        auth: gate,
        tunnel,
        http: reqwest::Client::new(),
        version: version.to_string(),
    });

    spawn_bus_pump(Arc::clone(&state), bus_rx);
    Ok(state)
}

/// Start the gateway HTTP + WebSocket server and block until shutdown.
pub async fn start_gateway(config: CcmuxConfig, version: &str) -> anyhow::Result<()> {
    let bind = config.server.bind.clone();
    let port = config.server.port;
    let remote = config.auth.enabled;

    let state = build_state(config, version).await?;
    let methods = Arc::new(MethodRegistry::new());
    let app = build_app(Arc::clone(&state), methods);

    let listener = TcpListener::bind((bind.as_str(), port)).await?;
    info!(bind = %bind, port, "gateway listening");

    // Remote mode brings the public tunnel up alongside the server.
    if remote {
        match state.tunnel.start(port).await {
            Ok(url) => info!(url = %url, "public tunnel ready"),
            Err(e) => warn!(error = %e, "tunnel start failed, continuing without it"),
        }
    }

    let shutdown_state = Arc::clone(&state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down: stopping gateways, leaving terminal windows");
        shutdown_state.orchestrator.cleanup().await;
        shutdown_state.tunnel.stop().await;
    })
    .await?;

    Ok(())
}
