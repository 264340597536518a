//! Upstream call abstraction for the metered API
//!
//! Defines the `Upstream` trait that decouples the dispatcher from the wire
//! protocol of the metered service. One `call` is exactly one outbound request
//! made with one credential. Failures carry an `ErrorClassification` so the
//! caller can decide between rotating the credential, backing off, or giving
//! up on the task.

pub mod classify;
pub mod http;

pub use classify::classify_status;
pub use http::{HeaderInjection, HttpUpstream, QueryParam};

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Classification of upstream errors to determine retry/rotation strategy.
///
/// - QuotaExceeded marks the credential exhausted and rotates to another
/// - InvalidCredential deactivates the credential and rotates to another
/// - Transient backs off and retries
/// - Permanent fails the task without retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retryable (timeouts, 5xx, per-minute rate limits)
    Transient,
    /// The credential's quota is spent according to upstream
    QuotaExceeded,
    /// The credential is invalid, expired or revoked
    InvalidCredential,
    /// The request itself is bad; retrying cannot help
    Permanent,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::InvalidCredential => "invalid_credential",
            ErrorClassification::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A failed upstream call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream {classification} error: {message}")]
pub struct UpstreamError {
    pub classification: ErrorClassification,
    /// HTTP status, when the failure came with a response
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(classification: ErrorClassification, message: impl Into<String>) -> Self {
        Self {
            classification,
            status: None,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Permanent, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Result alias for upstream calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// One outbound call: which endpoint, for which task, with which key.
#[derive(Clone, Copy)]
pub struct CallRequest<'a> {
    /// Call kind, also the key into the cost table (e.g. "search")
    pub kind: &'a str,
    /// The task's unit of work (e.g. a keyword)
    pub task: &'a str,
    /// Credential token for this call only
    pub token: &'a str,
}

impl fmt::Debug for CallRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRequest")
            .field("kind", &self.kind)
            .field("task", &self.task)
            .field("token", &common::mask(self.token))
            .finish()
    }
}

/// A successful upstream response. The payload is passed through untouched.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub body: serde_json::Value,
    /// Cost reported by upstream, if it reports one
    pub cost: Option<u64>,
}

/// Abstraction over the metered service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Upstream>`).
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    /// Perform exactly one call with the given credential.
    fn call<'a>(
        &'a self,
        request: CallRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<CallResponse>> + Send + 'a>>;
}
