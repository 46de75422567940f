use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Cannot consume producer {0} with the given capabilities")]
    IncompatibleCapabilities(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Media engine worker died")]
    EngineFatal,

    #[error("Transcoder failure: {0}")]
    SubprocessFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable error code sent to peers in error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PeerNotFound,
    TransportNotFound,
    ProducerNotFound,
    ConsumerNotFound,
    IncompatibleCapabilities,
    EngineError,
    EngineFatal,
    InvalidRequest,
    Internal,
}

impl Error {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PeerNotFound(_) => ErrorCode::PeerNotFound,
            Self::TransportNotFound(_) => ErrorCode::TransportNotFound,
            Self::ProducerNotFound(_) => ErrorCode::ProducerNotFound,
            Self::ConsumerNotFound(_) => ErrorCode::ConsumerNotFound,
            Self::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            Self::Engine(_) => ErrorCode::EngineError,
            Self::EngineFatal => ErrorCode::EngineFatal,
            Self::InvalidRequest(_) | Self::Serialization(_) => ErrorCode::InvalidRequest,
            Self::SubprocessFailure(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Whether the error only concerns the request that caused it
    #[must_use]
    pub const fn is_request_scoped(&self) -> bool {
        !matches!(self, Self::EngineFatal | Self::SubprocessFailure(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
