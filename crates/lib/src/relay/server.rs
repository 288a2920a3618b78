//! Relay HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::device::DeviceAuth;
use crate::gateway::GatewayLink;
use crate::relay::{auth, bridge};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared state for the relay: the gateway link every client session is bridged onto.
#[derive(Clone)]
pub struct RelayState {
    pub link: GatewayLink,
    /// Credential clients must present. None rejects every client.
    pub ui_token: Option<String>,
    /// Cancelled on SIGINT/SIGTERM; every client session sends `shutdown` and closes.
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(link: GatewayLink, ui_token: Option<String>) -> Self {
        Self {
            link,
            ui_token,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Build the gateway link from config, start connecting, and serve until a shutdown signal.
pub async fn run_relay(config: Config) -> Result<()> {
    let ui_token = config::resolve_ui_token(&config);
    if ui_token.is_none() {
        anyhow::bail!(
            "refusing to start relay without a client credential (set relay.auth.token or TETHER_UI_TOKEN)"
        );
    }
    let bind = config.relay.bind.trim();
    if !config::is_loopback_bind(bind) {
        log::warn!("relay bound to non-loopback address {}", bind);
    }

    let gateway = config::resolved_gateway(&config);
    let link = if gateway.device.enabled {
        let path = config::resolve_device_path(&gateway);
        let device = DeviceAuth::open(&path)
            .with_context(|| format!("loading device identity from {}", path.display()))?;
        log::info!("signing gateway handshakes as device {}", device.identity.device_id);
        GatewayLink::with_device(gateway, device)
    } else {
        GatewayLink::new(gateway)
    };

    let connecting = link.clone();
    tokio::spawn(async move {
        match connecting.connect().await {
            Ok(_) => log::info!("connected to gateway"),
            Err(e) => log::warn!("initial gateway connect failed: {}", e),
        }
    });

    let bind_addr = format!("{}:{}", bind, config.relay.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("relay listening on {}", bind_addr);

    serve(listener, RelayState::new(link, ui_token)).await
}

/// Serve on an already-bound listener until SIGINT/SIGTERM or `state.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: RelayState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let link = state.link.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("relay server exited")?;
    link.shutdown();
    log::info!("relay stopped");
    Ok(())
}

/// Completes on SIGINT, SIGTERM or cancellation, then cancels `shutdown` so client sessions close.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }
    log::info!("shutdown signal received, closing client sessions");
    shutdown.cancel();
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// GET /ws?token=… upgrades to WebSocket; the credential is checked after the upgrade so rejections carry a close code.
async fn ws_handler(
    State(state): State<RelayState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| bridge::handle_client(socket, state, query.token))
}

/// GET /api/health (bearer auth).
async fn health(State(state): State<RelayState>, headers: HeaderMap) -> Response {
    if !auth::validate_bearer(state.ui_token.as_deref(), &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" }))).into_response();
    }
    Json(json!({
        "status": "ok",
        "gatewayConnected": state.link.is_connected(),
        "helloOk": state.link.hello(),
    }))
    .into_response()
}
