//! HTTP transport
//!
//! `POST /mcp` carries one JSON-RPC object per request body; the response
//! is always status 200 with the JSON-RPC envelope (application errors live
//! inside it). `GET /health` reports coarse health plus the full probe
//! payload. HTTP requests run on an implicitly initialized session; the
//! handshake gate binds the line transport.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::errors::{ServerError, ServerResult};
use crate::protocol::{error_response, Session};
use crate::server::{LifecycleState, ServerContext, SERVER_NAME, SERVER_VERSION};

/// Build the transport's route table
pub fn app(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route("/health", get(health_endpoint))
        .with_state(ctx)
}

/// Bind the configured address
///
/// Kept separate from [`serve`] so startup failures surface as exit code 1
/// before any transport runs.
pub async fn bind(ctx: &ServerContext) -> ServerResult<TcpListener> {
    let addr = format!("{}:{}", ctx.config.server_host, ctx.config.server_port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Internal(format!("cannot bind http transport on {addr}: {e}")))
}

/// Serve until the server starts draining
pub async fn serve(ctx: Arc<ServerContext>, listener: TcpListener) -> ServerResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http transport listening");
    }
    let mut lifecycle = ctx.lifecycle_watch();
    let shutdown = async move {
        loop {
            if !matches!(*lifecycle.borrow(), LifecycleState::Running | LifecycleState::Initializing)
            {
                break;
            }
            if lifecycle.changed().await.is_err() {
                break;
            }
        }
    };
    axum::serve(
        listener,
        app(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| ServerError::Internal(format!("http transport failed: {e}")))
}

async fn mcp_endpoint(
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    let session = Arc::new(Session::pre_initialized("http-client"));
    let caller = Some(peer.ip().to_string());
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            let err = ServerError::InvalidRequest("request body is not valid JSON".to_owned());
            return (StatusCode::OK, Json(error_response(None, &err)));
        }
    };
    match ctx.handle_json(&session, value, caller).await {
        Some(response) => (StatusCode::OK, Json(response)),
        // Notification: nothing to return.
        None => (StatusCode::ACCEPTED, Json(json!({}))),
    }
}

async fn health_endpoint(State(ctx): State<Arc<ServerContext>>) -> Json<Value> {
    let report = ctx.health();
    Json(json!({
        "status": ctx.health_status(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "server_info": {
            "name": SERVER_NAME,
            "version": SERVER_VERSION,
            "started_at": ctx.started_at_utc().to_rfc3339_opts(SecondsFormat::Millis, true),
            "state": report.state,
            "outlook_connected": report.outlook_connected,
            "uptime_seconds": report.uptime_seconds,
            "pool_stats": report.pool_stats,
            "cache_stats": report.cache_stats,
            "rate_stats": report.rate_stats,
        },
    }))
}
