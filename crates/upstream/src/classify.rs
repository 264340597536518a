//! Error classification for metered API responses
//!
//! The upstream answers 403 for both "this key's daily quota is spent" and
//! "this key is not allowed", and 429/403 for short-term rate limits. The
//! response body's error reason is what tells them apart. Only quota
//! exhaustion rotates to another credential without deactivating this one.

use crate::ErrorClassification;

/// Reasons meaning the credential's quota for the current period is spent.
const QUOTA_PATTERNS: &[&str] = &["quotaexceeded", "dailylimitexceeded", "quota exceeded"];

/// Reasons meaning a short-term rate limit; the same key works again soon.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "ratelimitexceeded",
    "userratelimitexceeded",
    "rate limit",
];

/// Reasons meaning the key itself is unusable.
const INVALID_KEY_PATTERNS: &[&str] = &[
    "keyinvalid",
    "keyexpired",
    "api key not valid",
    "api key expired",
    "accessnotconfigured",
    "ipreferernotallowed",
    "forbidden",
];

fn matches_any(lower: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| lower.contains(p))
}

/// Classify an upstream error by HTTP status and response body.
///
/// Quota reasons win over everything else on 403/429. 401 and 403 without a
/// recognizable reason are treated as an invalid credential; 400 only when the
/// body names the key. 408/5xx are Transient, remaining 4xx are Permanent.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    let lower = body.to_lowercase();
    match status {
        403 | 429 if matches_any(&lower, QUOTA_PATTERNS) => ErrorClassification::QuotaExceeded,
        403 | 429 if matches_any(&lower, RATE_LIMIT_PATTERNS) => ErrorClassification::Transient,
        429 => ErrorClassification::Transient,
        401 | 403 => ErrorClassification::InvalidCredential,
        400 if matches_any(&lower, INVALID_KEY_PATTERNS) => {
            ErrorClassification::InvalidCredential
        }
        408 | 500..=599 => ErrorClassification::Transient,
        400..=499 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}
