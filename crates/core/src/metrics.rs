//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Jobs (final status, duration, dispatch queue depth)
//! - Items (per-item outcomes inside batch jobs)
//! - External tools (process spawns, conversion duration)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Jobs
// =============================================================================

/// Jobs finished by final status.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fetchcast_jobs_finished_total", "Total jobs finished"),
        &["status"], // "completed", "error", "canceled"
    )
    .unwrap()
});

/// Job wall-clock duration in seconds.
pub static JOB_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("fetchcast_job_duration_seconds", "Duration of whole jobs")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["mode"], // "single", "batch"
    )
    .unwrap()
});

/// Jobs waiting in the dispatch queue.
pub static DISPATCH_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "fetchcast_dispatch_queue_depth",
        "Jobs waiting for the dispatch queue",
    )
    .unwrap()
});

// =============================================================================
// Items
// =============================================================================

/// Batch items by outcome.
pub static ITEMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fetchcast_items_total", "Total batch items processed"),
        &["outcome"], // "converted", "reused", "skipped", "failed", "canceled"
    )
    .unwrap()
});

// =============================================================================
// External tools
// =============================================================================

/// External processes spawned by tool.
pub static PROCESS_SPAWNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fetchcast_process_spawns_total",
            "Total external processes spawned",
        ),
        &["tool"],
    )
    .unwrap()
});

/// Conversion duration in seconds.
pub static CONVERSION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "fetchcast_conversion_duration_seconds",
            "Duration of single conversions",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["format"],
    )
    .unwrap()
});

/// Returns every core metric for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(JOBS_FINISHED.clone()),
        Box::new(JOB_DURATION.clone()),
        Box::new(DISPATCH_QUEUE_DEPTH.clone()),
        Box::new(ITEMS_TOTAL.clone()),
        Box::new(PROCESS_SPAWNS.clone()),
        Box::new(CONVERSION_DURATION.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register_cleanly() {
        let registry = prometheus::Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        ITEMS_TOTAL.with_label_values(&["converted"]).inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "fetchcast_items_total"));
    }
}
