use relay_core::SessionIdKey;
use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    /// Which identifier sessions are registered and resolved under.
    pub session_id_key: SessionIdKey,
    /// WebSocket URL the calling platform is told to connect the relay to.
    pub public_ws_url: String,
    pub welcome_greeting: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let session_id_key = match std::env::var("SESSION_ID_KEY") {
            Ok(value) => value.parse::<SessionIdKey>().map_err(|e| {
                ConfigError::InvalidValue("SESSION_ID_KEY".to_string(), e.to_string())
            })?,
            Err(_) => SessionIdKey::default(),
        };

        let public_ws_url = std::env::var("PUBLIC_WS_URL")
            .unwrap_or_else(|_| "ws://localhost:8080/ws".to_string());
        if !(public_ws_url.starts_with("ws://") || public_ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "PUBLIC_WS_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", public_ws_url),
            ));
        }

        let welcome_greeting = std::env::var("WELCOME_GREETING")
            .ok()
            .filter(|greeting| !greeting.trim().is_empty());

        Ok(Self {
            bind_address,
            log_level,
            session_id_key,
            public_ws_url,
            welcome_greeting,
        })
    }
}
