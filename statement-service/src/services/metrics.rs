//! Prometheus metrics for statement-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for HTTP request duration by method, route, and status.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "statement_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path", "status"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "statement_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for file ingestion outcomes.
pub static INGEST_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "statement_ingest_outcomes_total",
        "Total number of ingested files by outcome",
        &["outcome"]
    )
    .expect("Failed to register INGEST_OUTCOMES")
});

/// Counter for statement processing outcomes.
pub static PROCESSING_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "statement_processing_total",
        "Total number of statement processing attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register PROCESSING_OUTCOMES")
});

/// Histogram for end-to-end statement processing duration.
pub static PROCESSING_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "statement_processing_duration_seconds",
        "Statement processing duration in seconds",
        &["outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register PROCESSING_DURATION")
});

/// Counter for job item outcomes.
pub static JOB_ITEM_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "statement_job_items_total",
        "Total number of processed job items by outcome",
        &["outcome"]
    )
    .expect("Failed to register JOB_ITEM_OUTCOMES")
});

/// Counter for applied sync deltas.
pub static SYNC_APPLIED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "statement_sync_applied_total",
        "Total number of sync transactions applied by kind",
        &["kind"]
    )
    .expect("Failed to register SYNC_APPLIED")
});

/// Counter for reconciliation results.
pub static RECONCILIATION_RESULTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "statement_reconciliation_results_total",
        "Total number of provisional rows resolved by reconciliation",
        &["result"]
    )
    .expect("Failed to register RECONCILIATION_RESULTS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "statement_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&INGEST_OUTCOMES);
    Lazy::force(&PROCESSING_OUTCOMES);
    Lazy::force(&PROCESSING_DURATION);
    Lazy::force(&JOB_ITEM_OUTCOMES);
    Lazy::force(&SYNC_APPLIED);
    Lazy::force(&RECONCILIATION_RESULTS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
