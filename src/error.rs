use thiserror::Error;

use crate::twophase::error::TwoPhaseError;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error(transparent)]
    TwoPhase(#[from] TwoPhaseError),
}
