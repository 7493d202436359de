use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    #[error("Duplicate dataset: {0}")]
    DuplicateDataset(String),

    #[error("Schema mismatch in dataset {dataset}: {message}")]
    SchemaMismatch { dataset: String, message: String },

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
