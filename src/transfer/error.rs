use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum TransferQueueError {
    #[error("invalid queue configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Stored transfer hash is missing a field or holds a non-numeric value
    #[error("malformed transfer record at {key}: bad or missing field '{field}'")]
    MalformedRecord { key: String, field: &'static str },

    #[error("invalid transfer id '{0}'")]
    InvalidTransferId(String),

    #[error("invalid block number '{value}' stored at {key}")]
    InvalidBlockNumber { key: String, value: String },

    #[error("not an ERC-20 transfer log: {0}")]
    InvalidLog(String),
}

pub type Result<T> = std::result::Result<T, TransferQueueError>;
