//! Error types for hearth.

use thiserror::Error;

/// Result type alias using hearth's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for hearth operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Job kind string has no registered handler
    #[error("Unknown job kind: {0}")]
    UnknownJobKind(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Cache operation failed
    #[error("Cache error: {0}")]
    Cache(String),

    /// Streaming delivery failed
    #[error("Stream error: {0}")]
    Stream(String),

    /// Outbound collaborator (web reader, mailer, message sink) failed
    #[error("Request error: {0}")]
    Request(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation can never succeed.
    ///
    /// Bad input and undecodable payloads stay bad across attempts; everything
    /// else (network, database, rate limits) is treated as transient.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::Serialization(_) | Error::UnknownJobKind(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
