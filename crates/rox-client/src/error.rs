use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoxError {
    #[error("invalid API key: {0}")]
    InvalidApiKey(String),
    #[error("flag already registered: {0}")]
    FlagAlreadyRegistered(String),
    #[error("client is shut down")]
    ShutDown,
    #[error("network error: {0}")]
    Network(String),
    #[error("setup error: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for RoxError {
    fn from(error: reqwest::Error) -> Self {
        RoxError::Network(error.to_string())
    }
}

impl From<anyhow::Error> for RoxError {
    fn from(error: anyhow::Error) -> Self {
        RoxError::Setup(error.to_string())
    }
}

/// Failure kinds carried by configuration-fetched events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherError {
    NoError,
    CorruptedJson,
    EmptyJson,
    SignatureVerificationError,
    NetworkError,
    MismatchAppKey,
    UnknownError,
}
