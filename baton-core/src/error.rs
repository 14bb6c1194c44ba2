use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatonError>;

/// Error returned by datum callbacks. Logged by the transition, never
/// propagated.
pub type DatumError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum BatonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Must call join() before loading dist data")]
    NotJoined,

    #[error("Membership error: {0}")]
    Membership(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Datum loader failed: {0}")]
    Loader(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for BatonError {
    fn from(err: bincode::Error) -> Self {
        BatonError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for BatonError {
    fn from(err: reqwest::Error) -> Self {
        BatonError::Transport(err.to_string())
    }
}
