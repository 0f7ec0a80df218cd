//! Behavior hooks invoked by the [`Engine`](crate::engine::Engine).

use crate::{
    protocol::{DtmfMessage, ErrorMessage, InterruptMessage, PromptMessage, SetupMessage},
    session::Session,
};
use async_trait::async_trait;
use tracing::debug;

/// Application behavior for a relay session.
///
/// Every hook has a default that only emits a trace, so implementations
/// override just the frames they care about. Hooks for one connection run
/// strictly one after another; an error returned from a hook is logged and the
/// connection keeps processing frames.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Called once the setup frame has been registered and merged into `session`.
    async fn on_setup(&self, _session: &Session, message: &SetupMessage) -> anyhow::Result<()> {
        debug!(call_sid = %message.call_sid, "Received setup message.");
        Ok(())
    }

    async fn on_prompt(&self, _session: &Session, message: &PromptMessage) -> anyhow::Result<()> {
        debug!(prompt = %message.voice_prompt, last = message.last, "Received prompt message.");
        Ok(())
    }

    async fn on_interrupt(
        &self,
        _session: &Session,
        message: &InterruptMessage,
    ) -> anyhow::Result<()> {
        debug!(
            utterance = %message.utterance_until_interrupt,
            duration_ms = message.duration_until_interrupt_ms,
            "Received interrupt message."
        );
        Ok(())
    }

    async fn on_dtmf(&self, _session: &Session, message: &DtmfMessage) -> anyhow::Result<()> {
        debug!(digit = %message.digit, "Received DTMF message.");
        Ok(())
    }

    async fn on_error(&self, _session: &Session, message: &ErrorMessage) -> anyhow::Result<()> {
        debug!(description = %message.description, "Received error message.");
        Ok(())
    }

    /// Called exactly once when the connection closes.
    async fn on_close(&self, _session: &Session) -> anyhow::Result<()> {
        debug!("Session closed.");
        Ok(())
    }
}

/// A handler that keeps every default hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl SessionHandler for DefaultHandler {}
