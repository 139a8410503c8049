//! Realtime relay WebSocket handler
//!
//! Each accepted client socket gets exactly one upstream connection. Client
//! frames are forwarded verbatim once the upstream is open; upstream frames are
//! forwarded verbatim to the client. Everything that happens to one session is
//! driven from a single `select!` loop, so frames keep their order and a client
//! close tears the upstream down in the same turn.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Extension,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use futures_util::stream::SplitSink;
use serde::Deserialize;
use tokio::select;
use tokio_tungstenite::tungstenite::{self, Message as UpstreamMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::Auth;
use crate::core::realtime::{
    SessionMode, UpstreamConfig, UpstreamSocket, connect_upstream, relay_error_event,
};
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How often an idle session is checked
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

type ClientSink = SplitSink<WebSocket, Message>;

/// Query parameters of `GET /realtime`.
///
/// `token` may also be present; it is consumed by the auth middleware.
#[derive(Debug, Default, Deserialize)]
pub struct RelayParams {
    /// `auto` or `manual`; the configured default when absent
    pub mode: Option<String>,
}

/// Returns the connection slot taken by the connection limit middleware.
struct ConnectionSlot {
    state: Arc<AppState>,
    ip: Option<IpAddr>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.state.release_connection(ip);
        }
    }
}

/// Realtime relay WebSocket handler
///
/// Resolves the session mode, then upgrades the connection and runs the relay
/// loop until either side goes away.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<Auth>,
    client_ip: Option<Extension<ClientIp>>,
    Query(params): Query<RelayParams>,
) -> Response {
    let mode = match params.mode.as_deref() {
        Some(raw) => match raw.parse::<SessionMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!(auth_id = ?auth.id, mode = %raw, "Rejecting relay request with unknown mode");
                return (StatusCode::BAD_REQUEST, e).into_response();
            }
        },
        None => state.config.default_mode,
    };

    let session_id = Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        auth_id = ?auth.id,
        mode = %mode,
        "Relay WebSocket upgrade requested"
    );

    // Dropped with the upgrade callback, so a failed upgrade also frees the slot
    let slot = ConnectionSlot {
        state: state.clone(),
        ip: client_ip.map(|Extension(ClientIp(ip))| ip),
    };
    let upstream = state.config.upstream_config();
    let idle_timeout = state.config.relay_idle_timeout();

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            run_relay(socket, upstream, mode, idle_timeout, &session_id).await;
        })
}

/// Drive one relay session to completion.
async fn run_relay(
    socket: WebSocket,
    upstream_config: UpstreamConfig,
    mode: SessionMode,
    idle_timeout: Duration,
    session_id: &str,
) {
    info!(session_id = %session_id, mode = %mode, "Relay session started");

    let (mut client_tx, mut client_rx) = socket.split();

    let connect = connect_upstream(&upstream_config, mode);
    tokio::pin!(connect);
    let mut connecting = true;
    let mut upstream: Option<UpstreamSocket> = None;

    let check_every = IDLE_CHECK_INTERVAL.min(idle_timeout);
    let mut idle_check =
        tokio::time::interval_at(tokio::time::Instant::now() + check_every, check_every);
    let mut last_activity = Instant::now();

    loop {
        select! {
            result = &mut connect, if connecting => {
                connecting = false;
                match result {
                    Ok(socket) => {
                        info!(session_id = %session_id, "Upstream realtime connection open");
                        upstream = Some(socket);
                    }
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "Failed to connect upstream");
                        if !send_client_error(&mut client_tx, &e.to_string()).await {
                            break;
                        }
                    }
                }
            }
            msg = client_rx.next() => {
                last_activity = Instant::now();
                let forwarded = match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(session_id = %session_id, bytes = text.len(), "Client text frame");
                        UpstreamMessage::Text(text.as_str().into())
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!(session_id = %session_id, bytes = data.len(), "Client binary frame");
                        UpstreamMessage::Binary(data)
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = %session_id, "Client closed relay connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "Client WebSocket error");
                        break;
                    }
                };

                let Some(socket) = upstream.as_mut() else {
                    warn!(session_id = %session_id, "Upstream not open, dropping client frame");
                    continue;
                };
                if let Err(e) = socket.send(forwarded).await {
                    error!(session_id = %session_id, error = %e, "Failed to forward frame upstream");
                    upstream = None;
                    if !send_client_error(&mut client_tx, &format!("Upstream send failed: {e}")).await {
                        break;
                    }
                }
            }
            msg = next_upstream(&mut upstream) => {
                last_activity = Instant::now();
                let forwarded = match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        debug!(session_id = %session_id, bytes = text.len(), "Upstream text frame");
                        Message::Text(text.as_str().into())
                    }
                    Some(Ok(UpstreamMessage::Binary(data))) => {
                        debug!(session_id = %session_id, bytes = data.len(), "Upstream binary frame");
                        Message::Binary(data)
                    }
                    Some(Ok(UpstreamMessage::Close(frame))) => {
                        info!(session_id = %session_id, frame = ?frame, "Upstream closed");
                        upstream = None;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(session_id = %session_id, error = %e, "Upstream WebSocket error");
                        upstream = None;
                        if !send_client_error(&mut client_tx, &upstream_error_message(&e)).await {
                            break;
                        }
                        continue;
                    }
                    None => {
                        info!(session_id = %session_id, "Upstream stream ended");
                        upstream = None;
                        continue;
                    }
                };

                if let Err(e) = client_tx.send(forwarded).await {
                    warn!(session_id = %session_id, error = %e, "Failed to forward frame to client");
                    break;
                }
            }
            _ = idle_check.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    warn!(
                        session_id = %session_id,
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Relay session idle, closing"
                    );
                    let _ = send_client_error(&mut client_tx, "Connection closed due to inactivity").await;
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    if let Some(mut socket) = upstream {
        if let Err(e) = socket.close(None).await {
            debug!(session_id = %session_id, error = %e, "Upstream close handshake failed");
        }
    } else if connecting {
        debug!(session_id = %session_id, "Aborting pending upstream connect");
    }

    info!(session_id = %session_id, "Relay session terminated");
}

/// Next frame from the upstream, or never while it is not open.
async fn next_upstream(
    upstream: &mut Option<UpstreamSocket>,
) -> Option<Result<UpstreamMessage, tungstenite::Error>> {
    match upstream {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

fn upstream_error_message(error: &tungstenite::Error) -> String {
    format!("Upstream connection error: {error}")
}

/// Send a relay error event; false when the client is gone.
async fn send_client_error(client_tx: &mut ClientSink, message: &str) -> bool {
    client_tx
        .send(Message::Text(relay_error_event(message).into()))
        .await
        .is_ok()
}
