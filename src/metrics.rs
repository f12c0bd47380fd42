use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramOpts, HistogramVec,
    IntCounterVec, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

// Requests answered by the gateway, by route and status code
pub static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_requests_total",
        "Requests answered by pinggate per route and status",
        &["route", "status"]
    )
    .unwrap()
});

pub static ADMISSION_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_admission_rejected_total",
        "Requests turned away by admission control",
        &["scope", "reason"]
    )
    .unwrap()
});

pub static PIPELINE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "gateway_pipeline_latency_ms",
        "Aggregation pipeline latency in milliseconds",
    )
    .buckets(LATENCY_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["pipeline"]).unwrap()
});

pub static STEP_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_step_failures_total",
        "Failed pipeline step attempts by origin",
        &["pipeline", "step", "origin"]
    )
    .unwrap()
});

/// Render every registered metric in the prometheus text format.
pub fn gather_text() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::error!("Failed to encode prometheus metrics: {e}");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_touched_metrics() {
        REQUESTS.with_label_values(&["metrics-test", "200"]).inc();
        let text = String::from_utf8(gather_text()).unwrap();
        assert!(text.contains("gateway_requests_total"));
    }
}
