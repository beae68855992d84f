use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LivewireError>;

#[derive(Error, Debug)]
pub enum LivewireError {
    #[error("Event queue is full (capacity {capacity})")]
    Backpressure { capacity: usize },

    #[error("Dependency '{dependency}' failed: {message}")]
    DependencyFailure { dependency: String, message: String },

    #[error("Transport '{channel}' failed: {message}")]
    TransportFailure { channel: String, message: String },

    #[error("Malformed input: {message}")]
    MalformedInput { message: String },

    #[error("Internal fault: {message}")]
    InternalFault { message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LivewireError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    pub fn dependency(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DependencyFailure {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn transport(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportFailure {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalFault {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Stable machine-readable code sent to clients in error frames.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Backpressure { .. } => ErrorCode::Backpressure,
            Self::DependencyFailure { .. } => ErrorCode::DependencyFailure,
            Self::TransportFailure { .. } => ErrorCode::TransportFailure,
            Self::MalformedInput { .. } | Self::Serialization(_) => ErrorCode::MalformedInput,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::InternalFault { .. } | Self::Persistence { .. } | Self::Config { .. } => {
                ErrorCode::InternalFault
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Backpressure,
    DependencyFailure,
    TransportFailure,
    MalformedInput,
    InternalFault,
    ShuttingDown,
}
