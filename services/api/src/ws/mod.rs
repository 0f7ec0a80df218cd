//! Relay WebSocket Handling
//!
//! This module binds the relay protocol engine to axum WebSockets:
//!
//! - `transport`: Adapts the socket's write half to the engine's `Transport`.
//! - `session`: Manages one connection's lifecycle, from upgrade to deregistration.
//! - `echo`: A demo behavior handler that echoes the caller back.

pub mod echo;
pub mod session;
pub mod transport;

pub use echo::EchoHandler;
pub use session::ws_handler;
