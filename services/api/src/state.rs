//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session registry,
//! the behavior handler for new connections, and the loaded configuration.

use crate::config::Config;
use relay_core::{SessionHandler, SessionRegistry};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub handler: Arc<dyn SessionHandler>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the state with an empty registry keyed by the configured policy.
    pub fn new(config: Config, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.session_id_key)),
            handler,
            config: Arc::new(config),
        }
    }
}
