//! Metrics collection using metrics-rs.
//!
//! All metrics go through the [`metrics`] facade; install any recorder
//! (Prometheus exporter, logging recorder, ...) to consume them. For
//! recorder-free introspection use
//! [`BufferPool::stats`](crate::BufferPool::stats) instead.

use ::metrics::{counter, gauge, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metric descriptions have been registered.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const BPAGE_STEALS: &str = "rxpool_bpage_steals";
const BPAGE_REUSES: &str = "rxpool_bpage_reuses";
const ALLOC_FAILURES: &str = "rxpool_alloc_failures";
const FREE_BPAGES: &str = "rxpool_free_bpages";

/// Register descriptions for all rxpool metrics.
///
/// Call once at application startup, after installing a recorder.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn describe_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    ::metrics::describe_counter!(
        BPAGE_STEALS,
        Unit::Count,
        "Bpages reclaimed from expired partial-page leases"
    );
    ::metrics::describe_counter!(
        BPAGE_REUSES,
        Unit::Count,
        "Owned bpages restarted from offset zero after full release"
    );
    ::metrics::describe_counter!(
        ALLOC_FAILURES,
        Unit::Count,
        "Message allocations rejected for lack of free bpages"
    );
    ::metrics::describe_gauge!(FREE_BPAGES, Unit::Count, "Free bpages in the pool");
}

/// Record a bpage stolen from an expired lease.
#[inline]
pub(crate) fn record_bpage_steal() {
    counter!(BPAGE_STEALS).increment(1);
}

/// Record an owned bpage restarted from its beginning.
#[inline]
pub(crate) fn record_bpage_reuse() {
    counter!(BPAGE_REUSES).increment(1);
}

/// Record an allocation rejected by the admission gate.
#[inline]
pub(crate) fn record_alloc_failure() {
    counter!(ALLOC_FAILURES).increment(1);
}

/// Update the free-bpage gauge.
#[inline]
pub(crate) fn record_free_bpages(free: usize) {
    gauge!(FREE_BPAGES).set(free as f64);
}
