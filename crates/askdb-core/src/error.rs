use thiserror::Error;

/// Top-level error type shared by the askdb crates.
///
/// Crates with their own taxonomy (the query pipeline, connectors) wrap this
/// type so that `?` works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AskError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for AskError {
    fn from(err: toml::de::Error) -> Self {
        AskError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AskError {
    fn from(err: toml::ser::Error) -> Self {
        AskError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AskError {
    fn from(err: serde_json::Error) -> Self {
        AskError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for askdb operations.
pub type Result<T> = std::result::Result<T, AskError>;
