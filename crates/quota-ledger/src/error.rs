//! Error types for ledger operations

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("ledger parse error: {0}")]
    Parse(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("duplicate credential: {0}")]
    Duplicate(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;
