//! WebSocket hub for worker agents.
//!
//! Workers connect inbound to `GET /ws/agent`, announce themselves with a
//! `register` frame, and then exchange dispatch-protocol frames. The hub
//! owns the per-connection outbound queue; everything stateful (registry
//! membership, in-flight accounting, frame translation) is delegated to
//! the registry and dispatcher.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::protocol::{AgentFrame, ServerFrame};

/// Outbound frames buffered per agent connection.
const OUTBOUND_BUFFER: usize = 64;

/// How long a fresh connection may stay silent before registering.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// GET /ws/agent -- upgrade an agent connection.
pub async fn agent_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_agent(socket, state))
}

async fn handle_agent(mut socket: WebSocket, state: AppState) {
    // First frame must be a register announce.
    let identity = match read_register(&mut socket).await {
        Some(identity) => identity,
        None => {
            warn!("agent connection closed before register");
            return;
        }
    };
    let agent_id = identity.agent_id.clone();

    let (tx, mut outbound) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    let replaced = state.registry.register(identity.clone(), tx);
    if !replaced.is_empty() {
        // A reconnect under the same id abandoned these tasks.
        state.dispatcher.agent_lost(&agent_id, replaced).await;
    }

    let capabilities = identity
        .capabilities
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(",");
    if let Err(err) = state
        .store
        .upsert_agent_seen(
            &agent_id,
            &identity.hostname,
            &identity.ip,
            &identity.version,
            &capabilities,
        )
        .await
    {
        warn!(agent_id, error = %err, "failed to record agent");
    }

    let ack = ServerFrame::RegisterAck {
        agent_id: agent_id.clone(),
    };
    if send_frame(&mut socket, &ack).await.is_err() {
        state.registry.unregister(&agent_id);
        return;
    }
    info!(agent_id, capabilities, "agent connected");

    // Queued tasks may now have a capable worker.
    state.dispatcher.on_capacity().await;

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    debug!(agent_id, "outbound send failed");
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AgentFrame>(&text) {
                            Ok(frame) => {
                                state.dispatcher.handle_agent_frame(&agent_id, frame).await;
                            }
                            Err(err) => {
                                warn!(agent_id, error = %err, "undecodable agent frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(agent_id, error = %err, "agent socket error");
                        break;
                    }
                }
            }
        }
    }

    let orphaned = state.registry.unregister(&agent_id);
    state.dispatcher.agent_lost(&agent_id, orphaned).await;
    info!(agent_id, "agent disconnected");
}

async fn read_register(socket: &mut WebSocket) -> Option<crate::types::AgentIdentity> {
    let deadline = tokio::time::timeout(REGISTER_TIMEOUT, async {
        while let Some(message) = socket.recv().await {
            match message {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<AgentFrame>(&text) {
                        Ok(AgentFrame::Register(identity)) => return Some(identity),
                        Ok(_) => {
                            warn!("first agent frame was not register");
                            return None;
                        }
                        Err(err) => {
                            warn!(error = %err, "undecodable register frame");
                            return None;
                        }
                    }
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {}
                Ok(Message::Close(_)) | Err(_) => return None,
            }
        }
        None
    });
    deadline.await.ok().flatten()
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
