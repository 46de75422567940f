use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Engine(#[from] stagecast_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No video producer available")]
    NoVideoProducer,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot describe stream: {0}")]
    InvalidDescription(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<BridgeError> for stagecast_core::Error {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Engine(inner) => inner,
            other => Self::SubprocessFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecast_core::ErrorCode;

    #[test]
    fn test_engine_errors_pass_through() {
        let err: stagecast_core::Error =
            BridgeError::Engine(stagecast_core::Error::EngineFatal).into();
        assert_eq!(err.code(), ErrorCode::EngineFatal);

        let err: stagecast_core::Error = BridgeError::NoVideoProducer.into();
        assert!(matches!(err, stagecast_core::Error::SubprocessFailure(_)));
    }
}
