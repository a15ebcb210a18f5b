use storage::StorageError;
use thiserror::Error;

/// Failure taxonomy shared by every layer of the client core.
///
/// The type is `Clone` so a single refresh outcome can be handed to every caller
/// that waited on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("session expired")]
    SessionExpired,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("malformed remote data: {0}")]
    MalformedRemoteData(String),
    #[error("remote api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("not signed in")]
    NotSignedIn,
}

impl ClientError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ClientError::SessionExpired)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Storage(_))
    }
}

impl From<StorageError> for ClientError {
    fn from(value: StorageError) -> Self {
        ClientError::Storage(value.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            ClientError::MalformedRemoteData(value.to_string())
        } else {
            ClientError::Network(value.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Network(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
