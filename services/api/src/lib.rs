//! Relay API Library Crate
//!
//! This library contains the web-facing half of the voice relay: configuration,
//! application state, the HTTP handlers, the WebSocket connection wiring, and
//! routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
