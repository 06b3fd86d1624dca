//! Durable control-plane connection with reconnect and re-announce.
//!
//! The worker connects outbound only (no listening ports). On connection
//! loss it reconnects with jittered exponential backoff capped at 30
//! seconds and announces itself again. Tasks in progress at disconnect are
//! cancelled locally; nothing is resumed -- the control plane has already
//! failed them.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::handlers::HandlerRegistry;
use crate::runner::TaskRunner;
use armitage::protocol::{AgentFrame, ServerFrame};
use armitage::types::AgentIdentity;

/// Reconnect backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Outbound frames buffered before handlers feel backpressure.
const OUTBOUND_BUFFER: usize = 64;

/// Run the worker until the process is stopped.
///
/// # Errors
///
/// Never returns `Ok`; an error indicates an unrecoverable setup failure.
pub async fn run(config: WorkerConfig, handlers: Arc<HandlerRegistry>) -> anyhow::Result<()> {
    let identity = build_identity(&config, &handlers);
    info!(
        agent_id = %identity.agent_id,
        capabilities = ?handlers.capabilities(),
        server = %config.agent.server_url,
        "molly worker starting"
    );

    let mut delay = BACKOFF_INITIAL;
    loop {
        match connect_async(config.agent.server_url.as_str()).await {
            Ok((socket, _response)) => {
                info!(server = %config.agent.server_url, "connected to control plane");
                delay = BACKOFF_INITIAL;
                serve_connection(socket, &config, &identity, &handlers).await;
                warn!("connection to control plane lost");
            }
            Err(err) => {
                warn!(error = %err, "failed to reach control plane");
            }
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        tokio::time::sleep(delay.saturating_add(jitter)).await;
        delay = delay.saturating_mul(2).min(BACKOFF_CAP);
    }
}

async fn serve_connection(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &WorkerConfig,
    identity: &AgentIdentity,
    handlers: &Arc<HandlerRegistry>,
) {
    let (mut sink, mut stream) = socket.split();

    // Announce first; the control plane ignores everything else until
    // registration.
    let register = AgentFrame::Register(identity.clone());
    let Ok(text) = serde_json::to_string(&register) else {
        return;
    };
    if sink.send(Message::Text(text)).await.is_err() {
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<AgentFrame>(OUTBOUND_BUFFER);
    let runner = TaskRunner::new(
        Arc::clone(handlers),
        config.agent.max_concurrent_tasks,
        outbound_tx,
    );

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(ServerFrame::RegisterAck { agent_id }) => {
                                info!(agent_id, "registration acknowledged");
                            }
                            Ok(ServerFrame::Task(request)) => {
                                info!(
                                    session_id = %request.session_id,
                                    kind = request.task_kind.as_str(),
                                    "task received"
                                );
                                runner.start(request);
                            }
                            Ok(ServerFrame::Cancel { session_id }) => {
                                runner.cancel(&session_id);
                            }
                            Err(err) => {
                                warn!(error = %err, "undecodable control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(error = %err, "socket error");
                        break;
                    }
                }
            }
        }
    }

    // Abort whatever is still running; the control plane fails these
    // sessions on its side of the disconnect.
    runner.cancel_all();
}

fn build_identity(config: &WorkerConfig, handlers: &HandlerRegistry) -> AgentIdentity {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_owned());
    let agent_id = config.agent.agent_id.clone().unwrap_or_else(|| {
        let suffix: String = Uuid::new_v4().to_string().chars().take(8).collect();
        format!("{hostname}-{suffix}")
    });
    AgentIdentity {
        agent_id,
        hostname,
        ip: local_ip().unwrap_or_else(|| "127.0.0.1".to_owned()),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        metadata: serde_json::json!({}),
        capabilities: handlers.capabilities(),
    }
}

/// Best-effort local address discovery via a non-sending UDP socket.
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}
