//! Error types for the simulation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter '{path}': {reason}")]
    InvalidParameter { path: String, reason: String },

    #[error("Architecture error: {0}")]
    Architecture(String),

    #[error("Command queue error: {0}")]
    Queue(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn invalid_parameter(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
