//! Error types for dispatching

use common::Secret;

/// Outcome of a single upstream call that did not succeed.
///
/// Credential-naming variants carry the raw id so the caller can exclude it
/// on the next attempt; `Display` only ever shows the masked form.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// No active credential can cover the call's cost.
    #[error("no credential available: {0}")]
    ResourceExhausted(String),

    #[error("quota exceeded on credential {}", .credential.masked())]
    QuotaExceeded { credential: Secret<String> },

    #[error("credential {} rejected: {message}", .credential.masked())]
    CredentialRevoked {
        credential: Secret<String>,
        message: String,
    },

    #[error("transient failure on credential {}: {message}", .credential.masked())]
    Transient {
        credential: Secret<String>,
        message: String,
    },

    #[error("permanent failure: {message}")]
    Permanent { message: String },
}

impl CallError {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CallError::ResourceExhausted(_) => "resource_exhausted",
            CallError::QuotaExceeded { .. } => "quota_exceeded",
            CallError::CredentialRevoked { .. } => "credential_revoked",
            CallError::Transient { .. } => "transient",
            CallError::Permanent { .. } => "permanent",
        }
    }
}

/// Fatal dispatcher errors. Everything else is recorded on the task.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The pool stayed exhausted while the ledger could not be reloaded.
    #[error("dispatcher halted: {0}")]
    Halted(String),

    #[error("invalid dispatcher config: {0}")]
    InvalidConfig(String),
}

/// A finished task report could not be stored.
#[derive(Debug, thiserror::Error)]
#[error("result sink error: {0}")]
pub struct SinkError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_credentials() {
        let err = CallError::Transient {
            credential: Secret::new("AIzaSyVerySecretKey".to_string()),
            message: "status 503".into(),
        };
        let rendered = err.to_string();
        assert!(!rendered.contains("VerySecret"), "leaked: {rendered}");
        assert!(rendered.contains("AIzaSy…"));
        assert_eq!(err.label(), "transient");

        let debug = format!("{err:?}");
        assert!(!debug.contains("VerySecret"), "leaked: {debug}");
    }
}
