use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("Invalid report: {0}")]
    InvalidReport(String),

    #[error("Invalid reset policy: {0}")]
    InvalidPolicy(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AccountingError>;
