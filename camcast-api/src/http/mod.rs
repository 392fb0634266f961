// Module: http
// WebSocket signaling endpoint and health probes

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Maximum size of one signaling frame in bytes
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, server: &camcast_core::ServerConfig) -> Self {
        Self {
            gateway,
            max_message_size: server.max_message_size,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
