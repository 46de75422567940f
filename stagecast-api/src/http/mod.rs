//! HTTP server: websocket upgrade plus health routes

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::impls::Coordinator;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Largest inbound websocket frame accepted
    pub max_message_size: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .route("/ws", get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
