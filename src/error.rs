//! Error types for factlens

use std::fmt;

/// Result type alias for factlens operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for factlens
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Storage backend errors
    Storage(String),
    /// A stored row or value could not be decoded
    Decode(String),
    /// Fact rejected at the ingestion boundary
    InvalidFact(String),
    /// Timeout
    Timeout,
    /// Pipeline channel closed
    ChannelClosed,
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::InvalidFact(msg) => write!(f, "Invalid fact: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ChannelClosed => write!(f, "Pipeline channel closed"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
