// Prometheus metrics exported by the worker on /metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "arbiter_executions_total",
        "Sandboxed executions by language and outcome",
        &["language", "outcome"]
    )
    .expect("register arbiter_executions_total");

    pub static ref EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "arbiter_execution_duration_seconds",
        "Wall-clock duration of sandboxed executions",
        &["language", "phase"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    )
    .expect("register arbiter_execution_duration_seconds");

    pub static ref EXECUTIONS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "arbiter_executions_in_flight",
        "Sandboxed processes currently holding a limiter permit"
    )
    .expect("register arbiter_executions_in_flight");

    pub static ref SUBMISSIONS_JUDGED: IntCounterVec = register_int_counter_vec!(
        "arbiter_submissions_judged_total",
        "Submissions leaving a worker, by resulting status",
        &["status"]
    )
    .expect("register arbiter_submissions_judged_total");

    pub static ref STALE_REQUEUES: IntCounter = register_int_counter!(
        "arbiter_stale_requeues_total",
        "Running submissions reclaimed by the staleness sweep"
    )
    .expect("register arbiter_stale_requeues_total");

    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "arbiter_queue_depth",
        "Queued submissions at the last sweep"
    )
    .expect("register arbiter_queue_depth");
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        EXECUTIONS_TOTAL.with_label_values(&["python", "success"]).inc();
        SUBMISSIONS_JUDGED.with_label_values(&["completed"]).inc();
        let text = render().unwrap();
        assert!(text.contains("arbiter_executions_total"));
        assert!(text.contains("arbiter_submissions_judged_total"));
    }
}
