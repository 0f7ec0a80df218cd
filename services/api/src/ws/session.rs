//! Manages the relay WebSocket connection lifecycle for one call.

use super::transport::WsTransport;
use crate::state::AppState;
use anyhow::Context;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Stream, StreamExt, future, stream::SplitStream};
use relay_core::{Engine, on_initialized};
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

/// Axum handler to upgrade an HTTP connection to a relay WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Runs one relay connection to completion.
///
/// The session is registered from the setup frame under the key the
/// configured policy derives from it, and removed again once the socket
/// closes, unless a newer session has taken over the key.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (socket_tx, socket_rx) = socket.split();
    let transport = Arc::new(WsTransport::new(socket_tx));
    let engine = Engine::new(transport.clone(), state.handler.clone());

    let registered_key = Arc::new(OnceLock::new());
    let callback = {
        let registry = state.registry.clone();
        let registered_key = registered_key.clone();
        on_initialized(move |session, setup| async move {
            let key = registry
                .key_for(&setup)
                .context("setup message carries no usable session key")?;
            registry.register(key.clone(), &session);
            let _ = registered_key.set(key);
            Ok::<_, anyhow::Error>(())
        })
    };

    engine.start(inbound_frames(socket_rx), Some(callback)).await;

    transport.shutdown().await;
    engine.close().await;
    if let Some(key) = registered_key.get() {
        state.registry.deregister(key, engine.session());
    }
    engine
        .session()
        .span()
        .in_scope(|| info!("Relay connection finished."));
}

/// Text frames from the relay, ending at the first close frame or read error.
fn inbound_frames(socket_rx: SplitStream<WebSocket>) -> impl Stream<Item = String> + Send {
    socket_rx
        .take_while(|msg| {
            let keep = match msg {
                Ok(Message::Close(_)) => {
                    info!("Relay sent close frame.");
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    error!(error = ?e, "Error receiving from relay WebSocket.");
                    false
                }
            };
            future::ready(keep)
        })
        .filter_map(|msg| {
            let frame = match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                Ok(Message::Binary(_)) => {
                    warn!("Ignoring binary frame from relay.");
                    None
                }
                _ => None,
            };
            future::ready(frame)
        })
}
