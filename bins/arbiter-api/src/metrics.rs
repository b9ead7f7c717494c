use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref SUBMISSIONS_ACCEPTED: IntCounterVec = register_int_counter_vec!(
        "arbiter_submissions_accepted_total",
        "Submissions accepted into the queue",
        &["language", "mode"]
    )
    .expect("Failed to register arbiter_submissions_accepted_total");

    pub static ref SUBMISSIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "arbiter_submissions_rejected_total",
        "Submissions rejected at enqueue",
        &["reason"]
    )
    .expect("Failed to register arbiter_submissions_rejected_total");

    pub static ref STATUS_QUERIES: IntCounterVec = register_int_counter_vec!(
        "arbiter_status_queries_total",
        "Submission status lookups by result",
        &["result"]
    )
    .expect("Failed to register arbiter_status_queries_total");
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
