//! Error types for the streaming client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Ring buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Writer already holds an uncompleted chunk")]
    Busy,

    #[error("Timed out waiting for buffer space")]
    Timeout,

    #[error("Invalid chunk size: {0}")]
    InvalidSize(usize),
}

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown message type: {0}")]
    UnknownType(u16),

    #[error("Malformed JSON payload: {0}")]
    Json(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection dropped: {0}")]
    Dropped(String),

    #[error("Stream task is not running")]
    NotRunning,

    #[error("Outgoing queue full")]
    QueueFull,
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
