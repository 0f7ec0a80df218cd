//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the relay service: the relay
//! WebSocket endpoint, the call-flow document, health, and the out-of-band
//! session endpoints.

use crate::{handlers, state::AppState, ws::ws_handler};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/twiml", get(handlers::twiml).post(handlers::twiml))
        .route("/ws", get(ws_handler))
        .route("/sessions/say", post(handlers::say))
        .route("/sessions/end", post(handlers::end_session))
        .with_state(app_state)
}
