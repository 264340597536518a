//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No active credential can cover the requested cost. The message is
    /// a JSON document with pool counts.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("duplicate credential: {0}")]
    Duplicate(String),

    /// The durable ledger could not be read or written.
    #[error("ledger error: {0}")]
    Ledger(#[from] quota_ledger::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
