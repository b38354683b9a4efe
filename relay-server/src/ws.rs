//! The WebSocket transport hub (spec.md §4.A) — the only I/O boundary.
//!
//! Upgrades the HTTP connection, registers it with the [`AxumTransport`],
//! resolves/mints the connecting participant's `SubjectId` (recovering it on
//! reconnect if a token is presented), then spawns the paired send/receive
//! tasks the teacher's relay used for every connection, generalized from its
//! binary postcard envelope to this system's typed `{event, payload}` JSON
//! envelope.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientEvent, ConnectionId, SubjectId};
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Tracks the last transport-level PONG (or any inbound traffic) for the
/// layer-1 heartbeat of §4.A. Shared between the reader task (which bumps
/// it) and the writer task (which checks it against `ping_timeout_ms`).
struct Heartbeat {
    last_seen_ms: AtomicI64,
}

impl Heartbeat {
    fn new() -> Self {
        Self { last_seen_ms: AtomicI64::new(now_ms()) }
    }

    fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::SeqCst);
    }

    fn elapsed_ms(&self) -> i64 {
        now_ms() - self.last_seen_ms.load(Ordering::SeqCst)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// A previously-issued `SubjectId`, presented so a reconnecting client
    /// can recover its prior registration (§4.B).
    pub token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.token))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, presented_token: Option<String>) {
    let conn_id = ConnectionId(Uuid::new_v4().to_string());
    let queue = state.transport.register_connection(conn_id.clone()).await;

    let subject_id = state
        .coordinator
        .register(conn_id.clone(), presented_token.map(SubjectId::from))
        .await;
    state.transport.bind_subject(subject_id.clone(), conn_id.clone()).await;
    tracing::info!(connection = %conn_id, subject = %subject_id, "connection established");

    let (mut sink, mut stream) = socket.split();
    let heartbeat = Arc::new(Heartbeat::new());

    // Layer 1 of §4.A: a low-level PING every `ping_interval_ms`, closing the
    // connection if no PONG (or any inbound traffic) arrives within
    // `ping_timeout_ms`. Distinct from the application-level `ping`/`pong`
    // RTT sampling handled in `Coordinator::handle_client_event`.
    let ping_interval = Duration::from_millis(state.coordinator.config.ping_interval_ms);
    let ping_timeout_ms = state.coordinator.config.ping_timeout_ms as i64;

    let writer_subject = subject_id.clone();
    let writer_conn = conn_id.clone();
    let writer_queue = queue.clone();
    let writer_heartbeat = heartbeat.clone();
    let mut writer_task = tokio::spawn(async move {
        loop {
            if writer_queue.is_overflowed() {
                tracing::warn!(connection = %writer_conn, subject = %writer_subject, "outbound queue overflowed, closing connection");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            if writer_heartbeat.elapsed_ms() >= ping_timeout_ms {
                tracing::warn!(connection = %writer_conn, subject = %writer_subject, "no pong within ping_timeout_ms, closing connection");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            for event in writer_queue.drain() {
                let Ok(text) = serde_json::to_string(&event) else {
                    tracing::error!(connection = %writer_conn, "failed to serialize outbound event");
                    continue;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = writer_queue.notify.notified() => {}
                _ = tokio::time::sleep(ping_interval) => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let reader_subject = subject_id.clone();
    let reader_state = state.clone();
    let reader_heartbeat = heartbeat.clone();
    let mut reader_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            reader_heartbeat.touch();
            match message {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => {
                            reader_state
                                .coordinator
                                .handle_client_event(reader_state.transport.as_ref(), &reader_subject, event)
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!(subject = %reader_subject, error = %e, "dropped malformed client event");
                        }
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => {
                    // axum/tungstenite already answers inbound Pings
                    // automatically; touching the heartbeat above is enough
                    // for both directions of liveness.
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(subject = %reader_subject, error = %e, "websocket read error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer_task => { reader_task.abort(); }
        _ = &mut reader_task => { writer_task.abort(); }
    }

    state.transport.deregister_connection(&conn_id).await;
    state.transport.forget_subject(&subject_id).await;
    state.coordinator.sessions.handle_disconnect(state.transport.as_ref(), &subject_id).await;
    tracing::info!(connection = %conn_id, subject = %subject_id, "connection closed");
}
