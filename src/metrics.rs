//! Prometheus metrics for the agent's own health
//!
//! The engine never surfaces its failures to the host program; dropped
//! traces, failed batches, and misuse are only visible through these
//! counters.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram,
};

lazy_static! {
    /// Traces accepted onto the batch queue.
    pub static ref TRACES_RECORDED: Counter = register_counter!(
        "traceline_traces_recorded_total",
        "Traces accepted onto the batch queue"
    ).expect("failed to register TRACES_RECORDED metric");

    /// Traces lost to queue overflow, per the configured overflow policy.
    pub static ref TRACES_DROPPED: Counter = register_counter!(
        "traceline_traces_dropped_total",
        "Traces dropped due to queue overflow"
    ).expect("failed to register TRACES_DROPPED metric");

    /// Batches delivered to the collector.
    pub static ref BATCHES_SENT: Counter = register_counter!(
        "traceline_batches_sent_total",
        "Report batches delivered to the collector"
    ).expect("failed to register BATCHES_SENT metric");

    /// Batches discarded after exhausting send attempts.
    pub static ref BATCHES_FAILED: Counter = register_counter!(
        "traceline_batches_failed_total",
        "Report batches discarded after exhausting send attempts"
    ).expect("failed to register BATCHES_FAILED metric");

    /// Individual send retries (excludes the first attempt).
    pub static ref SEND_RETRIES: Counter = register_counter!(
        "traceline_send_retries_total",
        "Transport send retries"
    ).expect("failed to register SEND_RETRIES metric");

    /// Instrumentation misuse recovered locally: unbalanced finish,
    /// start with no active operation, mismatched handles.
    pub static ref INSTRUMENTATION_MISUSE: Counter = register_counter!(
        "traceline_instrumentation_misuse_total",
        "Instrumentation misuse events recovered without raising"
    ).expect("failed to register INSTRUMENTATION_MISUSE metric");

    /// Contexts discarded by the max-open-duration cap.
    pub static ref STALE_CONTEXTS_DISCARDED: Counter = register_counter!(
        "traceline_stale_contexts_discarded_total",
        "Active contexts discarded after exceeding the max open duration"
    ).expect("failed to register STALE_CONTEXTS_DISCARDED metric");

    /// Current number of traces waiting in the batch queue.
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "traceline_queue_depth",
        "Traces currently waiting in the batch queue"
    ).expect("failed to register QUEUE_DEPTH metric");

    /// Wall time spent delivering one report batch, including retries.
    pub static ref REPORT_SEND_DURATION: Histogram = register_histogram!(
        "traceline_report_send_duration_seconds",
        "Time spent delivering one report batch, including retries"
    ).expect("failed to register REPORT_SEND_DURATION metric");
}

/// Touch the lazily-registered metrics so they exist in the registry
/// before the first event. Called from `Instrumenter::start`.
pub fn init() {
    QUEUE_DEPTH.set(0.0);
    let _ = TRACES_RECORDED.get();
    let _ = TRACES_DROPPED.get();
    let _ = BATCHES_SENT.get();
    let _ = BATCHES_FAILED.get();
}
