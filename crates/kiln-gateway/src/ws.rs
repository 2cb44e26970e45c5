// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket subscription handler.
//!
//! # Wire format
//!
//! Text frames carry JSON envelopes except the literal `"ping"`/`"pong"`
//! keepalives.  On join the hub replays the transcript tail (or everything
//! after `?from_seq=N` on reconnect), then switches to live fan-out; the
//! replay→live handover is deduplicated by sequence watermark so a
//! subscriber sees no gap and no duplicate.
//!
//! # Backpressure
//!
//! Each subscriber reads the orchestrator's broadcast channel, whose
//! capacity is the configured per-subscriber queue.  A subscriber that
//! falls behind past that window is disconnected with close code 4001 and
//! must reconnect with `from_seq` to catch up from the store.

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kiln_core::{OrchestratorHandle, SubmitRequest};
use kiln_protocol::{
    ClientCommand, Frame, ProjectId, CLOSE_NORMAL, CLOSE_PROJECT_UNKNOWN, CLOSE_SLOW_CONSUMER,
};
use kiln_store::Project;

use crate::server::AppState;

/// Inbound frames above this size are rejected with a protocol error.
const MAX_INBOUND_FRAME_BYTES: usize = 80 * 1024;

/// A ping is expected at least every 60 s; silence for twice that closes
/// the connection.
const KEEPALIVE_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Replay everything after this sequence number instead of the default
    /// tail window (reconnect catch-up).
    pub from_seq: Option<u64>,
}

/// HTTP handler for `GET /ws/:project_id`.
pub async fn ws_handler(
    Path(project_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, project_id, query.from_seq))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

pub async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    raw_project: String,
    from_seq: Option<u64>,
) {
    let Ok(project_id) = raw_project.parse::<ProjectId>() else {
        close_with(socket, CLOSE_PROJECT_UNKNOWN, "project_unknown").await;
        return;
    };
    let project = match state.projects.get(project_id).await {
        Ok(Some(project)) => project,
        _ => {
            close_with(socket, CLOSE_PROJECT_UNKNOWN, "project_unknown").await;
            return;
        }
    };
    let handle = match state.supervisor.orchestrator(project_id).await {
        Ok(handle) => handle,
        Err(e) => {
            debug!(%project_id, "orchestrator unavailable: {e}");
            close_with(socket, CLOSE_PROJECT_UNKNOWN, "project_unknown").await;
            return;
        }
    };

    info!(%project_id, "subscriber connected");
    run_socket(socket, state, project, handle, from_seq).await;
    info!(%project_id, "subscriber disconnected");
}

async fn run_socket(
    mut socket: WebSocket,
    state: AppState,
    project: Project,
    handle: OrchestratorHandle,
    from_seq: Option<u64>,
) {
    // Subscribe before reading history so no event can fall between replay
    // and live delivery; the watermark drops the overlap.
    let mut events = handle.subscribe();

    let replay = match from_seq {
        Some(seq) => state.store.since_seq(project.id, seq).await,
        None => {
            state
                .store
                .tail(project.id, state.config.core.history_replay_default)
                .await
        }
    };
    let mut watermark = from_seq.unwrap_or(0);
    match replay {
        Ok(rows) => {
            for row in rows {
                watermark = watermark.max(row.seq);
                if !send_frame(&mut socket, Frame::from_stored(&row)).await {
                    return;
                }
            }
        }
        Err(e) => {
            warn!(project = %project.id, "history replay failed: {e}");
        }
    }

    let mut last_inbound = Instant::now();
    let mut keepalive = tokio::time::interval(Duration::from_secs(15));

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        if !handle_text(&mut socket, &state, &project, &handle, &mut watermark, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_inbound = Instant::now();
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(project = %project.id, "socket recv error: {e}");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(row) => {
                        if row.seq <= watermark {
                            continue; // already replayed
                        }
                        watermark = row.seq;
                        if !send_frame(&mut socket, Frame::from_stored(&row)).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(project = %project.id, lagged = n, "slow consumer disconnected");
                        let _ = socket.send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SLOW_CONSUMER,
                            reason: "slow_consumer".into(),
                        }))).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = socket.send(Message::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: "orchestrator stopped".into(),
                        }))).await;
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                if last_inbound.elapsed() > KEEPALIVE_DEADLINE {
                    info!(project = %project.id, "keepalive expired, closing");
                    let _ = socket.send(Message::Close(Some(CloseFrame {
                        code: CLOSE_NORMAL,
                        reason: "keepalive timeout".into(),
                    }))).await;
                    break;
                }
            }
        }
    }
}

/// Process one inbound text frame.  Returns false when the socket is gone.
async fn handle_text(
    socket: &mut WebSocket,
    state: &AppState,
    project: &Project,
    handle: &OrchestratorHandle,
    watermark: &mut u64,
    text: &str,
) -> bool {
    if text == "ping" {
        return socket.send(Message::Text("pong".to_string())).await.is_ok();
    }
    if text.len() > MAX_INBOUND_FRAME_BYTES {
        return send_error(socket, format!("frame too large: {} bytes", text.len())).await;
    }

    match ClientCommand::parse(text) {
        Ok(ClientCommand::Submit(payload)) => {
            if let Err(e) = payload.validate(&project.workspace) {
                return send_error(socket, e.to_string()).await;
            }
            let mut request = SubmitRequest::from(payload);
            // The project's preferred model is the default when the submit
            // names none (the session's last model still wins over it).
            if request.model.is_none() {
                request.model = project.preferred_model.clone();
            }
            match handle.submit(request).await {
                Ok(request_id) => {
                    debug!(project = %project.id, request = %request_id, "submitted");
                    true
                }
                Err(e) => send_error(socket, format!("submit failed: {e}")).await,
            }
        }
        Ok(ClientCommand::Cancel { request_id }) => match handle.cancel(&request_id).await {
            Ok(kiln_core::CancelOutcome::Cancelled) => true,
            Ok(kiln_core::CancelOutcome::NotFound) => {
                send_error(socket, format!("cancel: request {request_id} not found")).await
            }
            Err(e) => send_error(socket, format!("cancel failed: {e}")).await,
        },
        Ok(ClientCommand::SubscribeFromSeq { seq }) => {
            // Mid-connection top-up: deliver persisted rows the subscriber
            // has not seen yet.
            let after = seq.max(*watermark);
            match state.store.since_seq(project.id, after).await {
                Ok(rows) => {
                    for row in rows {
                        *watermark = (*watermark).max(row.seq);
                        if !send_frame(socket, Frame::from_stored(&row)).await {
                            return false;
                        }
                    }
                    true
                }
                Err(e) => send_error(socket, format!("replay failed: {e}")).await,
            }
        }
        Err(e) => send_error(socket, e.to_string()).await,
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> bool {
    socket.send(Message::Text(frame.to_json())).await.is_ok()
}

/// Frame-layer errors go only to the offending client, as an `error`
/// envelope with kind `protocol`.
async fn send_error(socket: &mut WebSocket, message: String) -> bool {
    let frame = Frame {
        kind: "error".to_string(),
        data: serde_json::json!({
            "kind": "protocol",
            "message": message,
            "retryable": false,
        }),
        request_id: None,
        seq: None,
    };
    send_frame(socket, frame).await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
