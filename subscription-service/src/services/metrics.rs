//! Prometheus metrics for subscription-service.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, TextEncoder, histogram_opts, opts,
    register_histogram_vec, register_int_counter_vec,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Authorization decisions by feature and outcome
pub static AUTHORIZATION_DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "subscription_authorization_decisions_total",
            "Entitlement decisions by feature key and outcome"
        ),
        &["feature_key", "outcome"]
    )
    .expect("Failed to register AUTHORIZATION_DECISIONS_TOTAL")
});

/// Payment activations by outcome
pub static ACTIVATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "subscription_activations_total",
            "Payment verification attempts by outcome"
        ),
        &["outcome"]
    )
    .expect("Failed to register ACTIVATIONS_TOTAL")
});

/// Items processed by background jobs
pub static JOB_ITEMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "subscription_job_items_total",
            "Items processed by scheduled jobs"
        ),
        &["job", "result"]
    )
    .expect("Failed to register JOB_ITEMS_TOTAL")
});

/// Cache failures, which are logged and otherwise ignored
pub static CACHE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("subscription_cache_errors_total", "Cache operation failures"),
        &["operation"]
    )
    .expect("Failed to register CACHE_ERRORS_TOTAL")
});

/// Force registration so every series shows up on the first scrape.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&AUTHORIZATION_DECISIONS_TOTAL);
    Lazy::force(&ACTIVATIONS_TOTAL);
    Lazy::force(&JOB_ITEMS_TOTAL);
    Lazy::force(&CACHE_ERRORS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_authorization(feature_key: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    AUTHORIZATION_DECISIONS_TOTAL
        .with_label_values(&[feature_key, outcome])
        .inc();
}

pub fn record_activation(outcome: &str) {
    ACTIVATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_job_items(job: &str, result: &str, count: u64) {
    JOB_ITEMS_TOTAL.with_label_values(&[job, result]).inc_by(count);
}

pub fn record_cache_error(operation: &str) {
    CACHE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}
