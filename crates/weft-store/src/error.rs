use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("failed to decode record with key {key}: {message}")]
    Decode { key: String, message: String },
    #[error("failed to encode record with key {key}: {message}")]
    Encode { key: String, message: String },
    #[error("failed to modify record with key {key}: {message}")]
    Mutate { key: String, message: String },
    #[error("timeout trying to update record with key {key}")]
    Timeout { key: String },
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn decode(key: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn encode(key: &str, message: impl Into<String>) -> Self {
        Self::Encode {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn mutate(key: &str, message: impl Into<String>) -> Self {
        Self::Mutate {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(key: &str) -> Self {
        Self::Timeout {
            key: key.to_string(),
        }
    }

    pub fn invalid_cursor(message: impl Into<String>) -> Self {
        Self::InvalidCursor(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}
