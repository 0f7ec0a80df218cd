//! Wire protocol for the relay connection.
//!
//! Every frame is a UTF-8 JSON object carrying a `type` discriminant. Inbound
//! frames come from the calling platform, outbound frames are produced by the
//! [`Session`](crate::session::Session) operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Additional top-level fields merged into an outbound frame.
pub type Extra = Map<String, Value>;

/// Discriminants the engine knows how to dispatch.
pub const INBOUND_TYPES: [&str; 5] = ["setup", "prompt", "interrupt", "dtmf", "error"];

/// Why an inbound frame could not be turned into an [`InboundMessage`].
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Direction of the call that opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

/// The initialization frame. Its fields become the session's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub session_id: String,
    pub call_sid: String,
    pub account_sid: String,
    pub from: String,
    pub to: String,
    pub direction: Direction,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_call_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_sid: Option<String>,
}

/// A transcribed caller utterance, possibly one chunk of several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptMessage {
    pub voice_prompt: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptMessage {
    pub utterance_until_interrupt: String,
    pub duration_until_interrupt_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtmfMessage {
    pub digit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub description: String,
}

/// Frames sent by the calling platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Setup(SetupMessage),
    Prompt(PromptMessage),
    Interrupt(InterruptMessage),
    Dtmf(DtmfMessage),
    Error(ErrorMessage),
}

impl InboundMessage {
    /// Parses a raw text frame.
    ///
    /// Unknown discriminants are reported separately from malformed payloads so
    /// the engine can log the offending `type` value.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = match &value {
            Value::Object(map) => map.get("type").and_then(Value::as_str),
            _ => return Err(FrameError::NotAnObject),
        };
        match kind {
            None => Err(FrameError::MissingType),
            Some(kind) if !INBOUND_TYPES.contains(&kind) => {
                Err(FrameError::UnknownType(kind.to_string()))
            }
            Some(_) => Ok(serde_json::from_value(value)?),
        }
    }

    /// The wire discriminant of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Setup(_) => "setup",
            InboundMessage::Prompt(_) => "prompt",
            InboundMessage::Interrupt(_) => "interrupt",
            InboundMessage::Dtmf(_) => "dtmf",
            InboundMessage::Error(_) => "error",
        }
    }
}

/// Frames sent to the calling platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    /// A text token to be spoken.
    Text {
        token: String,
        last: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lang: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interruptible: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preemptible: Option<bool>,
    },
    /// Play media from a URI.
    Play {
        source: String,
        #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
        loop_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preemptible: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interruptible: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    SendDigits { digits: String },
    /// Switch the speech and/or transcription language.
    #[serde(rename_all = "camelCase")]
    Language {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tts_language: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcription_language: Option<String>,
    },
    /// Terminate the relay, optionally handing data back to the call flow.
    #[serde(rename_all = "camelCase")]
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handoff_data: Option<String>,
    },
}

impl OutboundMessage {
    pub fn text(token: impl Into<String>, last: bool) -> Self {
        OutboundMessage::Text {
            token: token.into(),
            last,
            lang: None,
            interruptible: None,
            preemptible: None,
        }
    }

    pub fn play(source: impl Into<String>) -> Self {
        OutboundMessage::Play {
            source: source.into(),
            loop_count: None,
            preemptible: None,
            interruptible: None,
        }
    }

    /// The wire discriminant of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Text { .. } => "text",
            OutboundMessage::Play { .. } => "play",
            OutboundMessage::SendDigits { .. } => "sendDigits",
            OutboundMessage::Language { .. } => "language",
            OutboundMessage::End { .. } => "end",
        }
    }

    /// Keys in an extension bag that must never be overwritten for this variant.
    fn protected_keys(&self) -> &'static [&'static str] {
        match self {
            OutboundMessage::Text { .. } => &["type", "token"],
            OutboundMessage::Play { .. } => &["type", "source"],
            OutboundMessage::SendDigits { .. } => &["type", "digits"],
            OutboundMessage::Language { .. } | OutboundMessage::End { .. } => &["type"],
        }
    }

    /// Serializes the message, merging `extra` into the top-level object.
    ///
    /// The discriminant and the variant-defining field win over the bag; any
    /// other key in the bag replaces the typed value.
    pub fn to_frame(&self, extra: &Extra) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            let protected = self.protected_keys();
            for (key, field) in extra {
                if !protected.contains(&key.as_str()) {
                    map.insert(key.clone(), field.clone());
                }
            }
        }
        serde_json::to_string(&value)
    }
}
