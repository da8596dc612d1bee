//! Live run log WebSocket

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::server::state::ServerState;
use crate::stream::frame::StreamFrame;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

/// Upgrade, then authenticate before any frame is sent
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let authorized = match query.token.as_deref() {
        Some(token) => state.verifier.verify(token).map_err(|e| e.to_string()),
        None => Err("missing token".to_string()),
    };

    ws.on_upgrade(move |socket| async move {
        match authorized {
            Ok(claims) => {
                debug!("{} streaming {}", claims.sub, id);
                serve_subscriber(socket, state, id).await;
            }
            Err(reason) => {
                debug!("Rejected stream of {}: {}", id, reason);
                close(socket, "authentication failed").await;
            }
        }
    })
}

async fn close(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

async fn serve_subscriber(socket: WebSocket, state: Arc<ServerState>, id: String) {
    let broadcaster = state.coordinator.broadcaster().clone();

    // Attach before reading the snapshot so no event falls in between
    let mut subscription = broadcaster.attach(&id);

    let snapshot = match state.coordinator.store().get(&id).await {
        Ok(Some(deployment)) => StreamFrame::initial(&deployment.logs, deployment.status),
        Ok(None) => {
            broadcaster.detach(&id, subscription.id);
            close(socket, "unknown deployment").await;
            return;
        }
        Err(e) => {
            warn!("Failed to load {} for streaming: {}", id, e);
            broadcaster.detach(&id, subscription.id);
            close(socket, "deployment unavailable").await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    if sender.send(Message::text(snapshot.to_json())).await.is_err() {
        broadcaster.detach(&id, subscription.id);
        return;
    }

    let heartbeat = state.heartbeat;
    let idle = sleep(heartbeat);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = subscription.frames.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::text(frame.to_json())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        idle.as_mut().reset(Instant::now() + heartbeat);
                        if text.as_str().trim() == "ping"
                            && sender.send(Message::text("pong")).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => idle.as_mut().reset(Instant::now() + heartbeat),
                }
            }
            _ = &mut idle => {
                if sender.send(Message::text(StreamFrame::heartbeat().to_json())).await.is_err() {
                    break;
                }
                idle.as_mut().reset(Instant::now() + heartbeat);
            }
        }
    }

    broadcaster.detach(&id, subscription.id);
    debug!("Stream of {} closed", id);
}
