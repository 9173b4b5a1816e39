//! Error types for leaseq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("priority must be a finite number, got {0}")]
    InvalidPriority(f64),

    #[error("retry budget must be at most {max}, got {0}", max = i32::MAX)]
    InvalidRetries(u32),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
