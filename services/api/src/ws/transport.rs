//! Write half of a relay WebSocket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, stream::SplitSink};
use relay_core::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// A [`Transport`] over the sink half of an axum WebSocket.
///
/// The connection counts as open until the read side finishes, a write
/// fails, or [`shutdown`](WsTransport::shutdown) is called.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    open: AtomicBool,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
        }
    }

    /// Marks the connection closed and sends a close frame if still possible.
    pub async fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.sink.lock().await.close().await {
                debug!(error = %e, "Close frame could not be sent.");
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_text(&self, frame: String) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            self.open.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }
}
