//! Per-connection session state and the outbound half of the protocol.

use crate::{
    error::Result,
    protocol::{Direction, Extra, OutboundMessage, SetupMessage},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};
use tracing::{Instrument, Span, field, warn};

/// The duplex connection a session writes to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether frames can currently be written.
    fn is_open(&self) -> bool;

    /// Writes one text frame.
    async fn send_text(&self, frame: String) -> anyhow::Result<()>;
}

/// Identity of a call, copied from its setup frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionInfo {
    pub call_sid: String,
    pub session_id: String,
    pub account_sid: String,
    pub from: String,
    pub to: String,
    pub direction: Direction,
    pub custom_parameters: HashMap<String, String>,
}

impl From<&SetupMessage> for SessionInfo {
    fn from(setup: &SetupMessage) -> Self {
        Self {
            call_sid: setup.call_sid.clone(),
            session_id: setup.session_id.clone(),
            account_sid: setup.account_sid.clone(),
            from: setup.from.clone(),
            to: setup.to.clone(),
            direction: setup.direction,
            custom_parameters: setup.custom_parameters.clone(),
        }
    }
}

/// Server-side state of one relay connection.
///
/// A session is created when the connection opens and learns its identity from
/// the setup frame. Every outbound operation checks the transport first and
/// drops the frame with a warning if the connection is no longer open.
pub struct Session {
    transport: Arc<dyn Transport>,
    info: OnceLock<SessionInfo>,
    start_time: DateTime<Utc>,
    span: Span,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            info: OnceLock::new(),
            start_time: Utc::now(),
            span: tracing::info_span!(
                "relay_session",
                call_sid = field::Empty,
                session_id = field::Empty
            ),
        }
    }

    /// The call identity, once the setup frame has been processed.
    pub fn info(&self) -> Option<&SessionInfo> {
        self.info.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.info.get().is_some()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Span carrying this connection's diagnostic context.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Stores the identity from `setup`. Returns `false` if it was already set.
    pub(crate) fn initialize(&self, setup: &SetupMessage) -> bool {
        if self.info.set(SessionInfo::from(setup)).is_err() {
            return false;
        }
        self.span.record("call_sid", setup.call_sid.as_str());
        self.span.record("session_id", setup.session_id.as_str());
        true
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.send_with(message, &Extra::new()).await
    }

    /// Sends `message` with `extra` merged into the frame.
    pub async fn send_with(&self, message: OutboundMessage, extra: &Extra) -> Result<()> {
        if !self.transport.is_open() {
            self.span.in_scope(|| {
                warn!(
                    kind = message.kind(),
                    "Connection is not open, dropping outbound message."
                )
            });
            return Ok(());
        }
        let frame = message.to_frame(extra)?;
        self.transport
            .send_text(frame)
            .instrument(self.span.clone())
            .await?;
        Ok(())
    }

    /// Sends a text token for speech synthesis. More tokens are expected to follow.
    pub async fn send_token(&self, token: impl Into<String>) -> Result<()> {
        self.send(OutboundMessage::text(token, false)).await
    }

    /// Sends the final token of a reply.
    pub async fn send_last_token(&self, token: impl Into<String>) -> Result<()> {
        self.send(OutboundMessage::text(token, true)).await
    }

    /// Like [`send_token`](Self::send_token); `extra` may also override `last`.
    pub async fn send_token_with(&self, token: impl Into<String>, extra: &Extra) -> Result<()> {
        self.send_with(OutboundMessage::text(token, false), extra)
            .await
    }

    pub async fn play(&self, source: impl Into<String>) -> Result<()> {
        self.send(OutboundMessage::play(source)).await
    }

    pub async fn play_with(&self, source: impl Into<String>, extra: &Extra) -> Result<()> {
        self.send_with(OutboundMessage::play(source), extra).await
    }

    pub async fn send_digits(&self, digits: impl Into<String>) -> Result<()> {
        self.send(OutboundMessage::SendDigits {
            digits: digits.into(),
        })
        .await
    }

    pub async fn language(
        &self,
        tts_language: Option<String>,
        transcription_language: Option<String>,
    ) -> Result<()> {
        self.send(OutboundMessage::Language {
            tts_language,
            transcription_language,
        })
        .await
    }

    /// Ends the relay, handing `handoff_data` back to the call flow.
    pub async fn end(&self, handoff_data: Option<String>) -> Result<()> {
        self.send(OutboundMessage::End { handoff_data }).await
    }

    pub async fn end_with(&self, handoff_data: Option<String>, extra: &Extra) -> Result<()> {
        self.send_with(OutboundMessage::End { handoff_data }, extra)
            .await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info.get())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}
