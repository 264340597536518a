//! Prometheus metrics exposition
//!
//! The library crates record through the `metrics` facade:
//!
//! - `crawler_calls_total` (counter): labels `kind`, `outcome`
//! - `crawler_call_duration_seconds` (histogram): label `kind`
//! - `crawler_tasks_total` (counter): label `outcome`
//! - `crawler_dispatcher_paused` (gauge)
//! - `pool_credentials` (gauge): label `status`
//! - `pool_pending_ledger_ops` (gauge)
//! - `pool_ledger_flush_failures_total` (counter)
//! - `pool_ledger_dropped_ops_total` (counter): operations on credentials the
//!   ledger no longer has

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Upstream call latency buckets, 50ms to the longest allowed call timeout.
const CALL_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("crawler_call_duration_seconds".to_string()),
            CALL_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `crawler_call_duration_seconds` gets explicit buckets so it renders as a
/// Prometheus histogram (with `_bucket` lines) rather than a summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
