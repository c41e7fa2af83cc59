//! Prometheus metrics exposed on the configured prometheus address.
//!
//! Phone numbers and other request contents never become label values.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

// Total number of accepted citizen submissions
pub static REQUESTS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "reliefops_requests_submitted_total",
        "The total number of aid requests accepted since reliefops started"
    )
    .unwrap()
});

// Approvals, split by how the map location was obtained
pub static REQUESTS_APPROVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "reliefops_requests_approved_total",
        "The total number of aid requests approved by operators",
        &["precision"] // exact, district or region
    )
    .unwrap()
});

pub static REQUESTS_DELETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "reliefops_requests_deleted_total",
        "The total number of aid requests removed by operators"
    )
    .unwrap()
});

pub static SIGNIN_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "reliefops_signin_failures_total",
        "The total number of rejected operator sign-in attempts"
    )
    .unwrap()
});

pub static PENDING_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "reliefops_pending_requests",
        "Requests waiting for operator verification"
    )
    .unwrap()
});

pub static ACTIVE_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "reliefops_active_requests",
        "Approved requests shown on the operator map"
    )
    .unwrap()
});

pub static CRITICAL_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "reliefops_critical_requests",
        "Approved requests with critical urgency"
    )
    .unwrap()
});

/// Publish the dashboard counters as gauges.
pub fn set_dashboard_gauges(pending: usize, active: usize, critical: usize) {
    PENDING_REQUESTS.set(pending as i64);
    ACTIVE_REQUESTS.set(active as i64);
    CRITICAL_REQUESTS.set(critical as i64);
}
