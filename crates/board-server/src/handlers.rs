//! HTTP routes and the live-channel connection loop.

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use board_core::{
    BroadcastConfig, BroadcastError, Board, Broadcaster, MessageId, SqliteStore, Store,
    Subscription,
};
use board_protocol::codec::{self, Encoded};
use board_protocol::{ClientFrame, Message, SendMessage, WireFormat};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Shared server state.
pub struct AppState {
    /// The message board.
    pub board: Board,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state over an existing store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let broadcaster = Broadcaster::with_config(BroadcastConfig {
            capacity: config.broadcast.capacity,
            max_subscribers: config.limits.max_connections,
        });

        Self {
            board: Board::new(store, Arc::new(broadcaster)),
            config,
        }
    }

    /// Open the configured SQLite database and create app state over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(config: Config) -> Result<Self> {
        let path = config.database_path();
        let store = SqliteStore::open(&path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?
            .with_max_text_length(config.limits.max_text_length);

        Ok(Self::new(config, Arc::new(store)))
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route("/", get(index_handler))
        .route("/messages", get(list_messages))
        .route("/messages/:id", delete(delete_message))
        .route("/health", get(health_handler))
        .route(&ws_path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::open(config)?);
    let app = app(Arc::clone(&state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Board server listening on http://{}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Client page.
async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.board.broadcaster().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": stats.subscriber_count,
        "published": stats.published_total,
    }))
}

/// Full history for initial sync.
async fn list_messages(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state.board.history().await?;
    Ok(Json(messages))
}

/// Delete a message. Always `204` once the store has processed it.
async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
) -> Result<StatusCode, ApiError> {
    let start = Instant::now();
    state.board.delete(id).await?;
    metrics::record_store_latency(start.elapsed().as_secs_f64());
    metrics::record_delete();
    metrics::record_event("delete_message");

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(default)]
    format: WireFormat,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    // Registered before the upgrade so the connection cap is checked and
    // claimed in one step; a failed upgrade drops the subscription again
    let connection_id = next_connection_id();
    let subscription = match state.board.broadcaster().subscribe(connection_id) {
        Ok(subscription) => subscription,
        Err(BroadcastError::MaxSubscribersReached(max)) => {
            warn!(max, "Refusing connection, subscriber limit reached");
            metrics::record_error("capacity");
            return ApiError::TooManyConnections.into_response();
        }
        Err(e) => {
            error!(error = %e, "Subscribe failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let format = params.format;
    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, subscription, format))
}

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_connection_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn_{:x}_{}", timestamp, seq)
}

type WsSender = SplitSink<WebSocket, WsMessage>;

/// Handle a live connection: subscribed until the socket goes away.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    mut subscription: Subscription,
    format: WireFormat,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = subscription.id().to_owned();
    let broadcaster = state.board.broadcaster();
    metrics::set_active_subscribers(broadcaster.subscriber_count());
    debug!(connection = %connection_id, ?format, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Binary frames may split or batch MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let heartbeat_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms.max(1)));
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events fanned out by the board
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if send_encoded(&mut sender, format, event.as_ref()).await.is_err() {
                    debug!(connection = %connection_id, "Send failed, dropping connection");
                    break;
                }
            }

            // Frames from the client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_seen = Instant::now();
                        metrics::record_frame("inbound");
                        match codec::from_json::<ClientFrame>(&text) {
                            Ok(frame) => handle_frame(frame, &connection_id, &state).await,
                            Err(e) => warn!(connection = %connection_id, error = %e, "Ignoring undecodable frame"),
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        last_seen = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientFrame>(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    metrics::record_frame("inbound");
                                    handle_frame(frame, &connection_id, &state).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Discarding undecodable binary data");
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }

                        if read_buffer.len() > state.config.limits.max_frame_size {
                            warn!(connection = %connection_id, buffered = read_buffer.len(), "Partial frame too large");
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    break;
                }
                if sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    broadcaster.unsubscribe(&connection_id);
    metrics::set_active_subscribers(broadcaster.subscriber_count());

    if subscription.dropped() > 0 {
        warn!(connection = %connection_id, dropped = subscription.dropped(), "Connection missed events");
    }
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded client frame.
async fn handle_frame(frame: ClientFrame, connection_id: &str, state: &AppState) {
    match frame {
        ClientFrame::SendMessage(SendMessage { text }) => {
            let start = Instant::now();
            match state.board.post(&text).await {
                Ok(Some(message)) => {
                    metrics::record_post(true);
                    metrics::record_event("new_message");
                    debug!(connection = %connection_id, id = message.id, "Post accepted");
                }
                Ok(None) => metrics::record_post(false),
                Err(e) => {
                    // No response channel for posts: log and drop
                    error!(connection = %connection_id, error = %e, "Post failed");
                    metrics::record_error("store");
                }
            }
            metrics::record_store_latency(start.elapsed().as_secs_f64());
        }
    }
}

/// Encode and send one frame.
async fn send_encoded<T: serde::Serialize>(
    sender: &mut WsSender,
    format: WireFormat,
    frame: &T,
) -> Result<()> {
    let msg = match codec::encode_as(format, frame)? {
        Encoded::Text(text) => WsMessage::Text(text),
        Encoded::Binary(data) => WsMessage::Binary(data.to_vec()),
    };
    metrics::record_frame("outbound");
    sender.send(msg).await?;
    Ok(())
}
