use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all notifier metrics
const PREFIX: &str = "notifier";

lazy_static! {
    // Served by the metrics port only
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Jobs
    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Job executions by outcome"),
        &["job", "status"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
        &["job"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_running"), "1 while the job is executing"),
        &["job"]
    ).expect("Failed to create job_running metric");

    pub static ref JOB_CONSECUTIVE_FAILURES: GaugeVec = GaugeVec::new(
        Opts::new(
            format!("{PREFIX}_job_consecutive_failures"),
            "Consecutive failed executions per job"
        ),
        &["job"]
    ).expect("Failed to create job_consecutive_failures metric");

    // Notifications
    pub static ref ENQUEUE_OUTCOMES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_enqueue_outcomes_total"), "Enqueue decisions by outcome"),
        &["trigger", "outcome"]
    ).expect("Failed to create enqueue_outcomes_total metric");

    pub static ref PREFERENCE_INTEGRITY_VIOLATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_preference_integrity_violations_total"),
            "Enqueues rejected because a preference entry was missing"
        ),
        &["trigger"]
    ).expect("Failed to create preference_integrity_violations_total metric");

    pub static ref DELIVERIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_deliveries_total"), "Delivery attempts by result"),
        &["channel", "result"]
    ).expect("Failed to create deliveries_total metric");

    pub static ref QUEUE_CLAIMS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_queue_claims_total"), "Queue entries claimed by workers"),
        &["channel"]
    ).expect("Failed to create queue_claims_total metric");

    pub static ref RECONCILED_ENTRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_reconciled_entries_total"),
            "Stale processing entries handled by reconciliation"
        ),
        &["result"]
    ).expect("Failed to create reconciled_entries_total metric");

    pub static ref EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_events_total"), "Domain events received"),
        &["event_type"]
    ).expect("Failed to create events_total metric");

    pub static ref DISPATCH_ERRORS_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_dispatch_errors_total"),
        "Event handler failures swallowed by the dispatcher"
    ).expect("Failed to create dispatch_errors_total metric");
}

/// Registers every metric. Safe to call more than once.
pub fn init_metrics() {
    // Already registered when a previous test got here first.
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(JOB_CONSECUTIVE_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(ENQUEUE_OUTCOMES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PREFERENCE_INTEGRITY_VIOLATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_CLAIMS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECONCILED_ENTRIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DISPATCH_ERRORS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Counts the request and observes its latency, labelled by route template.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_job_execution(job_id: &str, status: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL.with_label_values(&[job_id, status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn set_job_running(job_id: &str, running: bool) {
    JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn set_job_consecutive_failures(job_id: &str, failures: u32) {
    JOB_CONSECUTIVE_FAILURES
        .with_label_values(&[job_id])
        .set(failures as f64);
}

pub fn record_enqueue_outcome(trigger: &str, outcome: &str) {
    ENQUEUE_OUTCOMES_TOTAL
        .with_label_values(&[trigger, outcome])
        .inc();
}

pub fn record_preference_integrity_violation(trigger: &str) {
    PREFERENCE_INTEGRITY_VIOLATIONS_TOTAL
        .with_label_values(&[trigger])
        .inc();
}

pub fn record_delivery(channel: &str, result: &str) {
    DELIVERIES_TOTAL.with_label_values(&[channel, result]).inc();
}

pub fn record_queue_claims(channel: &str, count: usize) {
    QUEUE_CLAIMS_TOTAL
        .with_label_values(&[channel])
        .inc_by(count as f64);
}

pub fn record_reconciled(requeued: usize, failed: usize) {
    RECONCILED_ENTRIES_TOTAL
        .with_label_values(&["requeued"])
        .inc_by(requeued as f64);
    RECONCILED_ENTRIES_TOTAL
        .with_label_values(&["failed"])
        .inc_by(failed as f64);
}

pub fn record_event(event_type: &str) {
    EVENTS_TOTAL.with_label_values(&[event_type]).inc();
}

pub fn record_dispatch_error() {
    DISPATCH_ERRORS_TOTAL.inc();
}

/// GET /metrics in Prometheus text format
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_metric(name: &str) -> bool {
        REGISTRY.gather().iter().any(|m| m.get_name() == name)
    }

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        record_http_request("GET", "/health", 200, Duration::from_millis(3));
        assert!(find_metric("notifier_http_requests_total"));
    }

    #[test]
    fn test_job_metrics() {
        init_metrics();
        record_job_execution("job-1", "success", Duration::from_millis(20));
        set_job_running("job-1", true);
        set_job_consecutive_failures("job-1", 2);

        assert!(find_metric("notifier_job_executions_total"));
        assert_eq!(
            JOB_CONSECUTIVE_FAILURES.with_label_values(&["job-1"]).get(),
            2.0
        );
    }

    #[test]
    fn test_notification_metrics() {
        init_metrics();
        record_preference_integrity_violation("favorited");
        record_enqueue_outcome("favorited", "no_preference_configured");
        record_delivery("email", "sent");
        record_queue_claims("email", 3);

        assert!(find_metric("notifier_preference_integrity_violations_total"));
        assert!(
            QUEUE_CLAIMS_TOTAL.with_label_values(&["email"]).get() >= 3.0
        );
    }
}
