//! Quota-aware wrapper around one upstream call
//!
//! Looks up the call's cost, checks a credential out of the pool with that
//! cost reserved, makes exactly one call under a timeout and reports the
//! outcome back to the pool before returning.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Secret;
use credential_pool::{CostTable, Lease, Pool};
use tracing::{debug, info, warn};
use upstream::{CallRequest, ErrorClassification, Upstream};

use crate::error::CallError;

/// A successful call.
#[derive(Debug, Clone)]
pub struct CallSuccess {
    pub body: serde_json::Value,
    /// Units charged: the upstream-reported cost if any, else the table cost
    pub cost: u64,
    /// Masked id of the credential used
    pub credential: String,
}

/// Makes upstream calls with credentials from the pool.
pub struct RateLimitedClient {
    pool: Arc<Pool>,
    upstream: Arc<dyn Upstream>,
    costs: CostTable,
    call_timeout: Duration,
}

impl RateLimitedClient {
    pub fn new(
        pool: Arc<Pool>,
        upstream: Arc<dyn Upstream>,
        costs: CostTable,
        call_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            upstream,
            costs,
            call_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Cost of one call of `kind`, if the kind is known.
    pub fn cost(&self, kind: &str) -> Option<u64> {
        self.costs.cost(kind)
    }

    /// Make one call of `kind` for `task`, skipping credentials in `excluding`.
    ///
    /// - success → the cost is settled against the credential
    /// - quota exceeded → credential marked exhausted
    /// - invalid credential → credential deactivated
    /// - transient, permanent or timeout → reservation released, nothing charged
    pub async fn invoke(
        &self,
        kind: &str,
        task: &str,
        excluding: &HashSet<String>,
    ) -> Result<CallSuccess, CallError> {
        let Some(cost) = self.costs.cost(kind) else {
            record_call(kind, "unknown_kind", None);
            return Err(CallError::Permanent {
                message: format!("unknown call kind: {kind}"),
            });
        };

        let lease = match self.pool.checkout(cost, excluding).await {
            Ok(lease) => lease,
            Err(e) => {
                record_call(kind, "resource_exhausted", None);
                return Err(CallError::ResourceExhausted(e.to_string()));
            }
        };

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.call_timeout,
            self.upstream.call(CallRequest {
                kind,
                task,
                token: lease.token(),
            }),
        )
        .await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(response)) => {
                let charged = response.cost.unwrap_or(cost);
                let credential = lease.masked_id();
                match self.pool.settle(lease, charged).await {
                    Ok(remaining) => debug!(
                        credential = %credential,
                        kind,
                        cost = charged,
                        remaining,
                        "call succeeded"
                    ),
                    Err(e) => warn!(credential = %credential, error = %e, "failed to settle call"),
                }
                record_call(kind, "success", Some(elapsed));
                Ok(CallSuccess {
                    body: response.body,
                    cost: charged,
                    credential,
                })
            }
            Ok(Err(e)) => {
                record_call(kind, e.classification.label(), Some(elapsed));
                Err(self.report_failure(lease, kind, e).await)
            }
            Err(_) => {
                record_call(kind, "timeout", Some(elapsed));
                let credential = lease_secret(&lease);
                warn!(
                    credential = %lease.masked_id(),
                    kind,
                    timeout_secs = self.call_timeout.as_secs(),
                    "upstream call timed out"
                );
                self.pool.release(lease).await;
                Err(CallError::Transient {
                    credential,
                    message: format!(
                        "call timed out after {}ms",
                        self.call_timeout.as_millis()
                    ),
                })
            }
        }
    }

    /// Apply an upstream failure to the pool and map it to a `CallError`.
    async fn report_failure(
        &self,
        lease: Lease,
        kind: &str,
        error: upstream::UpstreamError,
    ) -> CallError {
        let credential = lease_secret(&lease);
        let masked = lease.masked_id();
        self.pool.release(lease).await;

        match error.classification {
            ErrorClassification::QuotaExceeded => {
                if let Err(e) = self.pool.mark_exhausted(credential.expose()).await {
                    warn!(credential = %masked, error = %e, "failed to mark credential exhausted");
                }
                info!(credential = %masked, kind, "credential quota exceeded upstream, rotating");
                CallError::QuotaExceeded { credential }
            }
            ErrorClassification::InvalidCredential => {
                if let Err(e) = self
                    .pool
                    .deactivate(credential.expose(), &error.message)
                    .await
                {
                    warn!(credential = %masked, error = %e, "failed to deactivate credential");
                }
                CallError::CredentialRevoked {
                    credential,
                    message: error.message,
                }
            }
            ErrorClassification::Transient => {
                debug!(credential = %masked, kind, error = %error.message, "transient upstream failure");
                CallError::Transient {
                    credential,
                    message: error.message,
                }
            }
            ErrorClassification::Permanent => {
                warn!(kind, status = ?error.status, error = %error.message, "permanent upstream failure");
                CallError::Permanent {
                    message: error.message,
                }
            }
        }
    }
}

fn lease_secret(lease: &Lease) -> Secret<String> {
    Secret::new(lease.credential_id().to_string())
}

/// Record a finished call attempt.
fn record_call(kind: &str, outcome: &'static str, elapsed: Option<Duration>) {
    metrics::counter!("crawler_calls_total", "kind" => kind.to_string(), "outcome" => outcome)
        .increment(1);
    if let Some(elapsed) = elapsed {
        metrics::histogram!("crawler_call_duration_seconds", "kind" => kind.to_string())
            .record(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeUpstream, memory_pool, ok, fail};
    use quota_ledger::CredentialStatus;

    fn client(pool: Arc<Pool>, upstream: Arc<FakeUpstream>) -> RateLimitedClient {
        RateLimitedClient::new(pool, upstream, CostTable::default(), Duration::from_secs(5))
    }

    async fn status(pool: &Pool, id: &str) -> (CredentialStatus, u64) {
        let cred = pool
            .snapshot()
            .await
            .into_iter()
            .find(|c| c.id == id)
            .unwrap();
        (cred.status, cred.remaining_quota)
    }

    #[tokio::test]
    async fn success_charges_table_cost() {
        let pool = memory_pool(&[("key-a-000001", 1_000)]).await;
        let upstream = FakeUpstream::new(|_| ok());
        let client = client(pool.clone(), upstream.clone());

        let success = client
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(success.cost, 100);
        assert_eq!(success.credential, "key-a-…");
        assert_eq!(status(&pool, "key-a-000001").await.1, 900);
        assert_eq!(upstream.calls().len(), 1);
        assert_eq!(upstream.calls()[0].token, "key-a-000001");
    }

    #[tokio::test]
    async fn upstream_reported_cost_wins() {
        let pool = memory_pool(&[("key-a-000001", 1_000)]).await;
        let upstream = FakeUpstream::new(|_| {
            Ok(upstream::CallResponse {
                body: serde_json::json!({}),
                cost: Some(7),
            })
        });
        let success = client(pool.clone(), upstream)
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(success.cost, 7);
        assert_eq!(status(&pool, "key-a-000001").await.1, 993);
    }

    #[tokio::test]
    async fn quota_exceeded_marks_exhausted_and_names_credential() {
        let pool = memory_pool(&[("key-a-000001", 1_000)]).await;
        let upstream = FakeUpstream::new(|_| fail(ErrorClassification::QuotaExceeded));
        let err = client(pool.clone(), upstream)
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap_err();

        match err {
            CallError::QuotaExceeded { credential } => {
                assert_eq!(credential.expose(), "key-a-000001")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            status(&pool, "key-a-000001").await,
            (CredentialStatus::Exhausted, 1_000)
        );
    }

    #[tokio::test]
    async fn invalid_credential_deactivates() {
        let pool = memory_pool(&[("key-a-000001", 1_000)]).await;
        let upstream = FakeUpstream::new(|_| fail(ErrorClassification::InvalidCredential));
        let err = client(pool.clone(), upstream)
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::CredentialRevoked { .. }));
        assert_eq!(
            status(&pool, "key-a-000001").await.0,
            CredentialStatus::Deactivated
        );
    }

    #[tokio::test]
    async fn transient_and_permanent_release_without_charge() {
        let pool = memory_pool(&[("key-a-000001", 100)]).await;

        let transient = FakeUpstream::new(|_| fail(ErrorClassification::Transient));
        let err = client(pool.clone(), transient)
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transient { .. }));

        let permanent = FakeUpstream::new(|_| fail(ErrorClassification::Permanent));
        let err = client(pool.clone(), permanent)
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Permanent { .. }));

        // Nothing charged, nothing left reserved.
        assert_eq!(
            status(&pool, "key-a-000001").await,
            (CredentialStatus::Active, 100)
        );
        assert!(pool.has_capacity(100).await);
    }

    #[tokio::test]
    async fn unknown_kind_is_permanent_without_checkout() {
        let pool = memory_pool(&[("key-a-000001", 100)]).await;
        let upstream = FakeUpstream::new(|_| ok());
        let err = client(pool, upstream.clone())
            .invoke("captions", "lofi", &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Permanent { .. }));
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn exhausted_pool_reports_resource_exhausted() {
        let pool = memory_pool(&[("key-a-000001", 99)]).await;
        let upstream = FakeUpstream::new(|_| ok());
        let err = client(pool, upstream.clone())
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::ResourceExhausted(_)));
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn excluded_credentials_are_not_used() {
        let pool = memory_pool(&[("key-a-000001", 1_000), ("key-b-000002", 500)]).await;
        let upstream = FakeUpstream::new(|_| ok());
        let excluding = HashSet::from(["key-a-000001".to_string()]);
        client(pool, upstream.clone())
            .invoke("search", "lofi", &excluding)
            .await
            .unwrap();
        assert_eq!(upstream.calls()[0].token, "key-b-000002");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_transient() {
        let pool = memory_pool(&[("key-a-000001", 1_000)]).await;
        let upstream = FakeUpstream::slow(Duration::from_secs(3600), |_| ok());
        let err = client(pool.clone(), upstream)
            .invoke("search", "lofi", &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transient { .. }), "got {err:?}");
        assert!(pool.has_capacity(1_000).await);
    }
}
