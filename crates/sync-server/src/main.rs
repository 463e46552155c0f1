#![forbid(unsafe_code)]

//! **sync-server** – Event-sync server binary.
//!
//! Wires an [`EventStore`] driver (in-memory or SQLite, chosen by
//! configuration), a [`SessionManager`], and a [`JwtAndLegacyVerifier`]
//! together behind an `axum` HTTP server exposing `GET /health` and the
//! `GET /ws?storeId=...&payload=...` upgrade route that carries the sync
//! protocol (`spec.md` §6.2).
//!
//! ## Usage
//!
//! ```bash
//! sync-server --storage sqlite --db-path data/sync.db --port 8080
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_auth::{IdentityVerifier, JwtAndLegacyVerifier};
use sync_handler::{ConnectionHandler, HandlerContext, HandshakeError};
use sync_session::SessionManager;
use sync_store_core::EventStore;
use sync_store_memory::MemoryEventStore;
use sync_store_sqlite::SqliteEventStore;
use sync_wire::encode_server_message;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "sync-server")]
#[command(about = "Event-sync server - per-store linear event log with cursor replay and push fan-out")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML), merged underneath environment and CLI overrides.
    #[arg(long)]
    config: Option<String>,

    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Port to bind the HTTP/WebSocket listener to.
    #[arg(long)]
    port: Option<u16>,

    /// Storage backend: "memory" or "sqlite".
    #[arg(long)]
    storage: Option<String>,

    /// Database path, used when `storage = sqlite`.
    #[arg(long)]
    db_path: Option<String>,

    /// Shared admin secret accepted by AdminResetRoomReq/AdminInfoReq.
    #[arg(long, env = "SYNC_ADMIN_SECRET")]
    admin_secret: Option<String>,

    /// HS256 secret used to verify handshake JWTs.
    #[arg(long, env = "SYNC_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Legacy shared-secret token accepted via `authToken`/`auth`.
    #[arg(long, env = "SYNC_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Maximum events per PullRes chunk.
    #[arg(long)]
    pull_chunk_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

//─────────────────────────────
//  Layered configuration
//─────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct ServerConfig {
    bind_addr: String,
    port: u16,
    storage: String,
    db_path: String,
    admin_secret: Option<String>,
    jwt_secret: String,
    auth_token: Option<String>,
    pull_chunk_size: usize,
    format_version: u32,
    log_level: String,
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let config_path = cli.config.as_deref().unwrap_or("config/sync-server.toml");

    let mut config: ServerConfig = config::Config::builder()
        .set_default("bind_addr", "0.0.0.0")?
        .set_default("port", 8080)?
        .set_default("storage", "memory")?
        .set_default("db_path", "data/sync.db")?
        .set_default("jwt_secret", "sync-server-secret-change-in-production")?
        .set_default("pull_chunk_size", sync_wire::DEFAULT_PULL_CHUNK_SIZE as i64)?
        .set_default("format_version", sync_store_core::FORMAT_VERSION as i64)?
        .set_default("log_level", "info")?
        .add_source(config::File::with_name(config_path).required(false))
        .add_source(config::Environment::with_prefix("SYNC"))
        .build()
        .context("building layered configuration")?
        .try_deserialize()
        .context("deserializing ServerConfig")?;

    apply_cli_overrides(&mut config, cli);
    Ok(config)
}

fn apply_cli_overrides(config: &mut ServerConfig, cli: &Cli) {
    if let Some(v) = &cli.bind_addr {
        config.bind_addr = v.clone();
    }
    if let Some(v) = cli.port {
        config.port = v;
    }
    if let Some(v) = &cli.storage {
        config.storage = v.clone();
    }
    if let Some(v) = &cli.db_path {
        config.db_path = v.clone();
    }
    if cli.admin_secret.is_some() {
        config.admin_secret = cli.admin_secret.clone();
    }
    if let Some(v) = &cli.jwt_secret {
        config.jwt_secret = v.clone();
    }
    if cli.auth_token.is_some() {
        config.auth_token = cli.auth_token.clone();
    }
    if let Some(v) = cli.pull_chunk_size {
        config.pull_chunk_size = v;
    }
    if let Some(v) = &cli.log_level {
        config.log_level = v.clone();
    }
}

//─────────────────────────────
//  Application state
//─────────────────────────────

#[derive(Clone)]
struct AppState {
    handler_ctx: Arc<HandlerContext>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    store_id: String,
    payload: Option<String>,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_logging(&config.log_level)?;
    info!("starting sync-server v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn EventStore> = match config.storage.as_str() {
        "memory" => Arc::new(MemoryEventStore::new()),
        "sqlite" => Arc::new(
            SqliteEventStore::open(&config.db_path, config.format_version)
                .await
                .with_context(|| format!("opening sqlite store at {}", config.db_path))?,
        ),
        other => anyhow::bail!("unsupported storage backend: {other}"),
    };
    info!(storage = %config.storage, "event store ready");

    let sessions = Arc::new(SessionManager::new());
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtAndLegacyVerifier::new(
        config.jwt_secret.clone(),
        config.auth_token.clone(),
        config.admin_secret.clone(),
    ));

    let handler_ctx = Arc::new(HandlerContext::new(
        store,
        sessions,
        verifier,
        config.admin_secret.clone(),
        config.pull_chunk_size,
    ));

    let state = AppState { handler_ctx };
    let app = create_app(state);

    let bind = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind to {bind}"))?;
    info!("listening on {bind}");
    info!("health check endpoint: http://{bind}/health");
    info!("websocket endpoint: ws://{bind}/ws");

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("http server error: {e}");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("sync-server stopped");
    Ok(())
}

//─────────────────────────────
//  HTTP application
//─────────────────────────────

fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(socket: WebSocket, query: WsQuery, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Payload absent -> unauthenticated-but-open (`None`); payload present
    // but not valid JSON -> close 1003 (`spec.md` §6.5, §7), distinct from
    // an absent payload rather than silently falling back to unauthenticated.
    let payload: Option<Value> = match query.payload.as_deref() {
        None => None,
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(store_id = %query.store_id, "malformed handshake payload");
                let _ = ws_sink
                    .send(Message::Close(Some(CloseFrame {
                        code: HandshakeError::MalformedPayload.close_code(),
                        reason: HandshakeError::MalformedPayload.to_string().into(),
                    })))
                    .await;
                return;
            }
        },
    };

    let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel();

    let handler = match ConnectionHandler::handshake(
        state.handler_ctx.clone(),
        query.store_id.clone(),
        payload,
        outbox_tx,
    )
    .await
    {
        Ok(handler) => Arc::new(handler),
        Err(e) => {
            warn!(store_id = %query.store_id, error = %e, "handshake rejected");
            let _ = ws_sink
                .send(Message::Close(Some(CloseFrame {
                    code: e.close_code(),
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let text = match encode_server_message(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "failed to encode outgoing message");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_handler = handler.clone();
    while let Some(Ok(message)) = ws_stream.next().await {
        if let Message::Text(text) = message {
            recv_handler.handle_message(&text).await;
        }
    }

    send_task.abort();
    handler.detach().await;
    info!(store_id = %query.store_id, "connection closed");
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_logging(log_level: &str) -> Result<()> {
    let filter = format!(
        "sync_server={log_level},sync_handler={log_level},sync_session={log_level},sync_auth={log_level},sync_store_sqlite={log_level},sync_store_memory={log_level}"
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
