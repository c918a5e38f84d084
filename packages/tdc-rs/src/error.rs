use thiserror::Error;

#[derive(Error, Debug)]
pub enum TdcError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Insufficient data: requested {requested} samples, {available} available")]
    InsufficientData { requested: usize, available: usize },

    #[error("Signal read failed for segment {segment} after {attempts} attempt(s): {message}")]
    Io {
        segment: usize,
        attempts: u32,
        message: String,
    },

    #[error("Degenerate cluster: {0}")]
    DegenerateCluster(String),

    #[error("Unknown cluster label: {0}")]
    InvalidLabel(i64),

    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    #[error("Catalogue not found: {0}")]
    CatalogueNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TdcError>;
