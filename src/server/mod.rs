//! Task control plane: REST + SSE surface, agent WebSocket hub, dispatch.
//!
//! The server composes five pieces around a shared [`AppState`]:
//! - [`store`] -- SQLite persistence
//! - [`bus`] -- per-session event sequencing and live fan-out
//! - [`registry`] -- connected-agent bookkeeping
//! - [`dispatch`] -- task queueing, cancellation, frame translation
//! - [`api`] / [`sse`] / [`ws`] / [`upload`] -- the HTTP surface

pub mod api;
pub mod bus;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod sse;
pub mod store;
pub mod upload;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use self::bus::EventBus;
use self::dispatch::Dispatcher;
use self::registry::AgentRegistry;
use self::store::Store;
use crate::config::ServerConfig;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<ServerConfig>,
    /// Persistence handle.
    pub store: Store,
    /// Event bus.
    pub bus: Arc<EventBus>,
    /// Connected-agent registry.
    pub registry: Arc<AgentRegistry>,
    /// Task dispatcher.
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Wire up the state graph over an opened store.
    pub fn new(config: ServerConfig, store: Store) -> Self {
        let bus = Arc::new(EventBus::new(store.clone()));
        let registry = Arc::new(AgentRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::clone(&bus),
            Arc::clone(&registry),
            Duration::from_secs(config.tasks.cancel_deadline_secs),
        ));
        Self {
            config: Arc::new(config),
            store,
            bus,
            registry,
            dispatcher,
        }
    }
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(api::create_task).get(api::list_tasks))
        .route(
            "/tasks/:session_id",
            get(api::get_task)
                .patch(api::update_task)
                .delete(api::delete_task),
        )
        .route("/tasks/:session_id/share", post(api::share_task))
        .route("/tasks/:session_id/terminate", post(api::terminate_task))
        .route("/tasks/:session_id/events", get(sse::session_events))
        .route("/tasks/:session_id/download", post(upload::download))
        .route("/upload", post(upload::upload))
        .route("/agents", get(api::list_agents))
        .route("/ws/agent", get(ws::agent_socket))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control plane on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("server error")?;
    Ok(())
}

/// Run the control plane until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.listen.addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "control plane listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;
    Ok(())
}
