use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, Query, State, WebSocketUpgrade},
        http::{HeaderMap, HeaderValue, Method, StatusCode, header},
        response::{IntoResponse, Json, Response},
        routing::get,
    },
    relay_config::RelayConfig,
    relay_protocol::{PROTOCOL_VERSION, error_codes},
    relay_store::SqliteMessageStore,
    serde::Deserialize,
    tokio::net::TcpListener,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{
    auth::{self, JwtAuth},
    state::{ConnectionHandle, GatewayState},
    supervisor::ConnectionSupervisor,
    ws::handle_connection,
};

// ── Server startup ───────────────────────────────────────────────────────────

/// CORS policy: a single allowed origin, or any origin for `"*"` or unset.
pub fn cors_layer(allowed_origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    Ok(match allowed_origin {
        Some("*") | None => cors.allow_origin(Any),
        Some(origin) => cors.allow_origin(origin.parse::<HeaderValue>()?),
    })
}

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind `bind:port`, moving on to the next port while the current one is
/// taken, for at most `port_search` extra attempts.
pub async fn bind_listener(bind: &str, port: u16, port_search: u16) -> anyhow::Result<TcpListener> {
    let mut candidate = port;
    let mut attempts = 0;
    loop {
        let addr: SocketAddr = format!("{bind}:{candidate}").parse()?;
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempts < port_search => {
                warn!(port = candidate, "port in use, trying next");
                attempts += 1;
                candidate = candidate
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("no free port above {port}"))?;
            },
            Err(e) => return Err(anyhow::anyhow!("failed to bind {addr}: {e}")),
        }
    }
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(config: RelayConfig) -> anyhow::Result<()> {
    let secret = config.auth.jwt_secret.as_ref().ok_or_else(|| {
        anyhow::anyhow!("no JWT secret configured (set JWT_SECRET, --jwt-secret or auth.jwt_secret)")
    })?;
    let auth = JwtAuth::new(secret, config.auth.leeway_secs);

    let db_path = config.storage.database_path();
    let store = Arc::new(SqliteMessageStore::open(&db_path).await?);
    let state = GatewayState::new(auth, store);

    let cors = cors_layer(config.server.allowed_origin.as_deref())?;
    let app = build_gateway_app(Arc::clone(&state), cors);

    let listener = bind_listener(
        &config.server.bind,
        config.server.port,
        config.server.port_search,
    )
    .await?;
    let addr = listener.local_addr()?;

    // Startup banner.
    let lines = [
        format!("relay gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("store: {}", db_path.display()),
        format!(
            "cors: {}",
            config.server.allowed_origin.as_deref().unwrap_or("any origin")
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "protocol": PROTOCOL_VERSION,
        "connections": state.client_count().await,
        "online": state.presence.count().await,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::bearer_token)
        .map(str::to_string)
        .or(query.token);

    let conn_id = uuid::Uuid::new_v4().to_string();
    let (handle, outbound) = ConnectionHandle::channel(&conn_id);
    let mut supervisor = ConnectionSupervisor::new(state, handle);

    if let Err(e) = supervisor.authenticate(token.as_deref()) {
        warn!(conn_id = %conn_id, remote = %addr, error = %e, "websocket connect rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {
                    "code": error_codes::UNAUTHENTICATED,
                    "message": e.to_string(),
                }
            })),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(socket, supervisor, outbound, addr))
}
