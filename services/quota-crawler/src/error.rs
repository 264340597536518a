//! Service-specific error types

use std::path::PathBuf;

use thiserror::Error;

/// Startup errors outside configuration loading.
///
/// Task and call failures never surface here; they are recorded on the task.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {}: {source}", path.display())]
    Input {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open results file {}: {source}", path.display())]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("credential pool error: {0}")]
    Pool(#[from] credential_pool::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
