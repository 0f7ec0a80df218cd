//! The per-connection protocol engine.
//!
//! An [`Engine`] owns one [`Session`] and drives its inbound frames through a
//! [`SessionHandler`]. Frames are dispatched one at a time in arrival order;
//! the next frame is not read until the previous hook has completed.

use crate::{
    handler::SessionHandler,
    protocol::{FrameError, InboundMessage, SetupMessage},
    session::{Session, Transport},
};
use anyhow::anyhow;
use futures_util::{
    FutureExt, Stream, StreamExt,
    future::BoxFuture,
};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Callback run when the setup frame arrives, before identity is merged and
/// before any later frame is dispatched. This is where a session is registered.
pub type OnInitialized =
    Box<dyn FnOnce(Arc<Session>, SetupMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Boxes an async closure as an [`OnInitialized`] callback.
pub fn on_initialized<F, Fut>(f: F) -> OnInitialized
where
    F: FnOnce(Arc<Session>, SetupMessage) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |session, setup| Box::pin(f(session, setup)))
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, setup frame not yet seen.
    Open,
    /// Setup frame is being processed.
    Initializing,
    /// Identity known, frames flow freely.
    Active,
    /// Terminal.
    Closed,
}

pub struct Engine {
    session: Arc<Session>,
    handler: Arc<dyn SessionHandler>,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            session: Arc::new(Session::new(transport)),
            handler,
            state: watch::Sender::new(ConnectionState::Open),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Processes `frames` until the stream ends or [`close`](Self::close) is called.
    ///
    /// Malformed frames and unknown message types are logged and skipped.
    pub async fn start<S>(&self, frames: S, on_initialized: Option<OnInitialized>)
    where
        S: Stream<Item = String> + Send,
    {
        let mut on_initialized = on_initialized;
        let mut frames = std::pin::pin!(frames);
        async {
            info!("Relay connection opened.");
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    frame = frames.next() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                self.handle_frame(&frame, &mut on_initialized).await;
            }
            debug!("Frame loop finished.");
        }
        .instrument(self.session.span().clone())
        .await
    }

    /// Stops frame dispatch and runs the close hook. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.state.send_replace(ConnectionState::Closed);
        async {
            info!("Relay connection closed.");
            if let Err(e) = guarded(self.handler.on_close(&self.session)).await {
                error!(error = ?e, "Close hook failed.");
            }
        }
        .instrument(self.session.span().clone())
        .await
    }

    async fn handle_frame(&self, frame: &str, on_initialized: &mut Option<OnInitialized>) {
        let message = match InboundMessage::parse(frame) {
            Ok(message) => message,
            Err(FrameError::UnknownType(kind)) => {
                warn!(%kind, "Ignoring message with unknown type.");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse inbound frame.");
                return;
            }
        };

        let kind = message.kind();
        let session = &self.session;
        let result = match message {
            InboundMessage::Setup(setup) => self.initialize(setup, on_initialized).await,
            InboundMessage::Prompt(prompt) => guarded(self.handler.on_prompt(session, &prompt)).await,
            InboundMessage::Interrupt(interrupt) => {
                guarded(self.handler.on_interrupt(session, &interrupt)).await
            }
            InboundMessage::Dtmf(dtmf) => guarded(self.handler.on_dtmf(session, &dtmf)).await,
            InboundMessage::Error(err) => guarded(self.handler.on_error(session, &err)).await,
        };
        if let Err(e) = result {
            error!(kind, error = ?e, "Message handler failed.");
        }
    }

    async fn initialize(
        &self,
        setup: SetupMessage,
        on_initialized: &mut Option<OnInitialized>,
    ) -> anyhow::Result<()> {
        if self.session.is_initialized() {
            warn!(call_sid = %setup.call_sid, "Ignoring duplicate setup message.");
            return Ok(());
        }
        self.transition(ConnectionState::Initializing);

        if let Some(callback) = on_initialized.take() {
            if let Err(e) = guarded(callback(self.session.clone(), setup.clone())).await {
                error!(error = ?e, "Initialization callback failed.");
            }
        }
        self.session.initialize(&setup);
        info!(from = %setup.from, to = %setup.to, "Session initialized.");
        self.transition(ConnectionState::Active);

        guarded(self.handler.on_setup(&self.session, &setup)).await
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}

/// Runs a hook, turning a panic into an error so one bad frame cannot take
/// down the connection task.
async fn guarded<F>(hook: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("hook panicked")),
    }
}
