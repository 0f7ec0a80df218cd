use thiserror::Error;

/// Failures of an outbound operation on a session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to serialize outbound frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
