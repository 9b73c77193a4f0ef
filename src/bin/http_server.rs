use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use clap::Parser;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use toolgate::clock::system_clock;
use toolgate::config::RequestMetadata;
use toolgate::errors::{ErrorContext, GatewayError};
use toolgate::gateway::{Gateway, GatewaySettings, ToolRequest, ToolResult};
use toolgate::session::{TransportMetadata, DEFAULT_CALLER_ID};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Header carrying the caller id
const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Management API gateway, HTTP transport
///
/// Each caller identifies itself with the `mcp-session-id` header and supplies its
/// connection settings as `x-*` headers.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// HTTP server port
    #[arg(short = 'P', long = "port", default_value = "3000")]
    port: u16,

    /// Seconds of inactivity before a caller and its backend sessions are dropped
    #[arg(long, env = "TOOLGATE_IDLE_TIMEOUT_SECS", default_value = "1800")]
    idle_timeout_secs: u64,

    /// Maximum number of concurrent callers
    #[arg(long, env = "TOOLGATE_MAX_SESSIONS", default_value = "100")]
    max_sessions: usize,

    /// Seconds between idle-caller sweeps
    #[arg(long, env = "TOOLGATE_CLEANUP_INTERVAL_SECS", default_value = "60")]
    cleanup_interval_secs: u64,

    /// Maximum show-task polls per script run
    #[arg(long, default_value_t = toolgate::task::DEFAULT_MAX_RETRIES)]
    max_task_polls: u32,
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

/// Lower-cased header map as seen by the configuration resolver
fn request_metadata(headers: &HeaderMap) -> RequestMetadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn caller_id(headers: &HeaderMap) -> String {
    header(headers, SESSION_ID_HEADER)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn invalid_request(reason: String) -> ToolResult {
    ToolResult::failure(&ErrorContext::new(GatewayError::InvalidRequest { reason }))
}

async fn tools_call(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let caller_id = caller_id(&headers);
    let session_header = [(SESSION_ID_HEADER, caller_id.clone())];

    if caller_id == DEFAULT_CALLER_ID {
        let result = invalid_request(format!("'{DEFAULT_CALLER_ID}' is reserved for the stdio transport"));
        return (StatusCode::BAD_REQUEST, Json(result)).into_response();
    }

    let request = match serde_json::from_value::<ToolRequest>(body) {
        Ok(request) => request,
        Err(e) => {
            warn!("[HttpServer] Rejected request from {}: {}", caller_id, e);
            let result = invalid_request(format!("request is not a valid tool call: {e}"));
            return (StatusCode::BAD_REQUEST, session_header, Json(result)).into_response();
        }
    };

    let metadata = request_metadata(&headers);
    let transport = TransportMetadata::http(header(&headers, "origin"), header(&headers, "user-agent"));
    let result = state.gateway.handle(&caller_id, &metadata, transport, request).await;

    (StatusCode::OK, session_header, Json(result)).into_response()
}

async fn end_session(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    let caller_id = header(&headers, SESSION_ID_HEADER).ok_or(StatusCode::BAD_REQUEST)?;
    if caller_id == DEFAULT_CALLER_ID {
        return Err(StatusCode::BAD_REQUEST);
    }

    let removed = state.gateway.end_session(&caller_id).await.map_err(|e| {
        error!("[HttpServer] Failed to end session {}: {}", caller_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if removed {
        Ok(Json(json!({ "status": "ended", "session_id": caller_id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let report = state.gateway.status_report().map_err(|e| {
        error!("[HttpServer] Failed to build status report: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({
        "service": "toolgate",
        "timestamp": Utc::now().to_rfc3339(),
        "active_callers": report.active_callers,
        "callers": report.callers,
    })))
}

// Liveness probe
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "toolgate",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[HttpServer] Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("[HttpServer] Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let settings = GatewaySettings {
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        max_sessions: args.max_sessions,
        max_task_polls: args.max_task_polls,
        ..Default::default()
    };
    let gateway = Arc::new(Gateway::new(settings, system_clock()));

    let sweeper = {
        let gateway = Arc::clone(&gateway);
        let period = Duration::from_secs(args.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match gateway.evict_idle().await {
                    Ok(evicted) if !evicted.is_empty() => {
                        info!("[HttpServer] Evicted idle sessions: {:?}", evicted);
                    }
                    Ok(_) => {}
                    Err(e) => error!("[HttpServer] Idle sweep failed: {}", e),
                }
            }
        })
    };

    let app = Router::new()
        .route("/tools/call", post(tools_call))
        .route("/session", delete(end_session))
        .route("/status", get(status))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(AppState {
            gateway: Arc::clone(&gateway),
        });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("[HttpServer] Listening on http://{}", addr);
    info!("[HttpServer] Tool endpoint: http://{}/tools/call", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    gateway.shutdown().await;

    Ok(())
}
