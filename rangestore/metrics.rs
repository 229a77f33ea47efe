use prometheus::{
    exponential_buckets, linear_buckets, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    pub static ref SERVER_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "rangestore_server_requests",
        "Requests processed by range server workers",
        &["type"]
    )
    .unwrap();
    pub static ref WORK_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "rangestore_work_queue_depth",
        "Work items waiting for a range server worker"
    )
    .unwrap();
    pub static ref WORK_TIME_HISTOGRAM: Histogram = register_histogram!(
        "rangestore_work_ns",
        "Nanos for a worker to process a work item",
        linear_buckets(20_000f64, 1.5f64, 20usize).unwrap()
    )
    .unwrap();
    pub static ref BULK_DESTINATIONS_HISTOGRAM: Histogram = register_histogram!(
        "rangestore_bulk_destinations",
        "Destinations of a routed request",
        linear_buckets(1f64, 1f64, 16usize).unwrap()
    )
    .unwrap();
    pub static ref BULK_RECORDS_HISTOGRAM: Histogram = register_histogram!(
        "rangestore_bulk_records",
        "Records in a routed request",
        exponential_buckets(1f64, 2f64, 20usize).unwrap()
    )
    .unwrap();
    pub static ref FRAMES_SENT: IntCounter = register_int_counter!(
        "rangestore_frames_sent",
        "Frames written to remote ranks"
    )
    .unwrap();
    pub static ref ROUTING_ERRORS: IntCounter = register_int_counter!(
        "rangestore_routing_errors",
        "Requests rejected before reaching a range server"
    )
    .unwrap();
    pub static ref FLUSH_TIME_HISTOGRAM: Histogram = register_histogram!(
        "rangestore_stat_flush_ns",
        "Nanos to distribute statistics for an index",
        exponential_buckets(100_000f64, 2f64, 16usize).unwrap()
    )
    .unwrap();
}

/// Renders every registered metric in the text exposition format.
pub fn render() -> String {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        error!("Unable to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters() {
        FRAMES_SENT.inc_by(0);
        SERVER_REQUESTS.with_label_values(&["put"]).inc();
        let text = render();
        assert!(text.contains("rangestore_frames_sent"));
        assert!(text.contains("rangestore_server_requests"));
    }
}
