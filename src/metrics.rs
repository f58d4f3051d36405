// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the reconciliation core.
//!
//! All instruments live on a crate-local registry with the namespace prefix
//! `rezone_firestoned_io`. The embedding controller manager decides how the
//! registry is exposed; this module only collects.
//!
//! # Metrics Categories
//!
//! - **Zone Metrics** - reconciliation outcomes and durations per zone
//! - **Change Metrics** - emitted change requests per action
//! - **Lookup Metrics** - lookup-processor job accounting
//! - **Cache Metrics** - zone-state cache effectiveness

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;
use std::time::Duration;

/// Namespace prefix for all rezone metrics (prometheus-safe)
const METRICS_NAMESPACE: &str = "rezone_firestoned_io";

/// Crate-local Prometheus metrics registry.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Total number of zone reconciliations by zone and outcome
///
/// Labels:
/// - `zone`: hosted zone id
/// - `status`: outcome (`success`, `error`, `deferred`)
pub static ZONE_RECONCILIATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_zone_reconciliations_total"),
        "Total number of zone reconciliations by zone and outcome",
    );
    let counter = CounterVec::new(opts, &["zone", "status"]).unwrap();
    METRICS_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Duration of zone reconciliations in seconds
pub static ZONE_RECONCILIATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_zone_reconciliation_duration_seconds"),
        "Duration of zone reconciliations in seconds by zone",
    )
    .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    let histogram = HistogramVec::new(opts, &["zone"]).unwrap();
    METRICS_REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

/// Change requests emitted by the change model, by action
///
/// Labels:
/// - `action`: `create`, `update` or `delete`
pub static CHANGE_REQUESTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_change_requests_total"),
        "Total number of change requests emitted by action",
    );
    let counter = CounterVec::new(opts, &["action"]).unwrap();
    METRICS_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Lookup jobs executed by the lookup processor
pub static LOOKUPS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        format!("{METRICS_NAMESPACE}_lookups_total"),
        "Total number of lookup jobs executed",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Lookup jobs skipped because the previous run was still in flight
pub static LOOKUPS_SKIPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        format!("{METRICS_NAMESPACE}_lookups_skipped_total"),
        "Total number of lookup jobs skipped while still running",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Lookup jobs whose resolved IP set changed
pub static LOOKUP_CHANGES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        format!("{METRICS_NAMESPACE}_lookup_changes_total"),
        "Total number of lookup jobs detecting a changed IP set",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Zone-state cache hits
pub static ZONE_CACHE_HITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        format!("{METRICS_NAMESPACE}_zone_cache_hits_total"),
        "Total number of zone-state cache hits",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Zone-state cache misses (expired or absent)
pub static ZONE_CACHE_MISSES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        format!("{METRICS_NAMESPACE}_zone_cache_misses_total"),
        "Total number of zone-state cache misses",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Record the outcome of a zone reconciliation.
pub fn record_zone_reconciliation(zone: &str, status: &str, duration: Duration) {
    ZONE_RECONCILIATIONS_TOTAL
        .with_label_values(&[zone, status])
        .inc();
    ZONE_RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[zone])
        .observe(duration.as_secs_f64());
}

/// Record emitted change requests.
pub fn record_change_requests(action: &str, count: u64) {
    if count > 0 {
        CHANGE_REQUESTS_TOTAL
            .with_label_values(&[action])
            .inc_by(count as f64);
    }
}

/// Render all registered metrics in the Prometheus text format.
///
/// # Errors
///
/// Returns an error when encoding fails (malformed UTF-8 cannot occur with
/// the text encoder; failures indicate a registry bug).
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod metrics_tests;
