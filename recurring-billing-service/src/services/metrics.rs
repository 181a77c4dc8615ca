//! Prometheus metrics for recurring-billing-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoice/client transitions by outcome (per-tenant metering)
pub static INVOICE_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices created, by how they came to exist
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Events the notifier failed to deliver
pub static NOTIFICATION_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);

    INVOICE_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoice_transitions_total",
                "Billing transitions by tenant, operation and outcome"
            ),
            &["tenant_id", "operation", "outcome"]
        )
        .expect("Failed to register INVOICE_TRANSITIONS_TOTAL")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoices_created_total",
                "Invoices created by tenant and origin"
            ),
            &["tenant_id", "origin"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    NOTIFICATION_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_notification_failures_total",
                "Billing events that could not be delivered"
            ),
            &["event"]
        )
        .expect("Failed to register NOTIFICATION_FAILURES_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });
}

pub fn record_transition(tenant_id: &str, operation: &str, outcome: &str) {
    if let Some(counter) = INVOICE_TRANSITIONS_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, operation, outcome])
            .inc();
    }
}

pub fn record_invoice_created(tenant_id: &str, origin: &str) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, origin]).inc();
    }
}

pub fn record_notification_failure(event: &str) {
    if let Some(counter) = NOTIFICATION_FAILURES_TOTAL.get() {
        counter.with_label_values(&[event]).inc();
    }
}

pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
