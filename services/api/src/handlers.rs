//! Axum Handlers for the HTTP API
//!
//! Besides health and the call-flow document, these handlers act on a live
//! relay session from outside its connection. They only see their own request
//! payload, so the session is found through the registry's key resolver.

use axum::{
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::{fmt::Write, sync::Arc};
use tracing::{error, info};

use crate::state::AppState;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Optional explicit registry key, bypassing key derivation.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub key: Option<String>,
}

/// Liveness probe with the number of live sessions.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeSessions": state.registry.active_count(),
    }))
}

/// Call-flow document that connects an incoming call to this relay.
pub async fn twiml(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;
    let mut relay = format!(
        r#"<ConversationRelay url="{}""#,
        escape_xml(&config.public_ws_url)
    );
    if let Some(greeting) = &config.welcome_greeting {
        let _ = write!(relay, r#" welcomeGreeting="{}""#, escape_xml(greeting));
    }
    relay.push_str(" />");

    let body = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect>{relay}</Connect></Response>"#
    );
    ([(header::CONTENT_TYPE, "application/xml")], body)
}

/// Speaks `text` on the session the payload resolves to.
pub async fn say(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    Json(payload): Json<Map<String, Value>>,
) -> Result<StatusCode, ApiError> {
    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("`text` is required".to_string()))?;

    let session = state
        .registry
        .resolve(query.key.as_deref(), &payload)
        .ok_or_else(|| ApiError::NotFound("No active session matches the request".to_string()))?;

    session.send_last_token(text).await?;
    info!("Sent out-of-band text to session.");
    Ok(StatusCode::ACCEPTED)
}

/// Ends the session the payload resolves to, passing `handoffData` through.
///
/// A non-string `handoffData` is forwarded as its JSON encoding.
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    Json(payload): Json<Map<String, Value>>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .registry
        .resolve(query.key.as_deref(), &payload)
        .ok_or_else(|| ApiError::NotFound("No active session matches the request".to_string()))?;

    let handoff_data = match payload.get("handoffData") {
        None | Some(Value::Null) => None,
        Some(Value::String(data)) => Some(data.clone()),
        Some(other) => Some(serde_json::to_string(other)?),
    };
    session.end(handoff_data).await?;
    info!("Ended session on request.");
    Ok(StatusCode::ACCEPTED)
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("plain"), "plain");
        assert_eq!(
            escape_xml(r#"Hi "there" & <welcome>"#),
            "Hi &quot;there&quot; &amp; &lt;welcome&gt;"
        );
        assert_eq!(escape_xml("it's"), "it&apos;s");
    }
}
