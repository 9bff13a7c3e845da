//! Client transport metrics
//!
//! Prometheus-compatible metrics recorded through the `metrics` facade:
//! - Request counts, durations and retries
//! - Node state (absent/alive/dead)
//! - Sniff and resurrection outcomes
//! - Multi-search batch sizes
//!
//! No exporter is installed here; the embedding application decides.

use crate::node::NodeStatus;
use std::time::{Duration, Instant};

/// Record request duration
pub fn record_request_duration(method: &str, duration: Duration) {
    metrics::histogram!(
        "prism_client_request_duration_seconds",
        "method" => method.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record request success
pub fn record_request_success(method: &str) {
    metrics::counter!(
        "prism_client_requests_total",
        "method" => method.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record request error
pub fn record_request_error(method: &str, error_type: &str) {
    metrics::counter!(
        "prism_client_requests_total",
        "method" => method.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "prism_client_request_errors_total",
        "method" => method.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record a retry on another node
pub fn record_retry(reason: &str) {
    metrics::counter!(
        "prism_client_retries_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Gauge value of `prism_client_node_state`: 0 = not in the pool, 1 = alive,
/// 2 = dead
pub fn node_state_value(status: Option<NodeStatus>) -> f64 {
    match status {
        None => 0.0,
        Some(NodeStatus::Alive) => 1.0,
        Some(NodeStatus::Dead) => 2.0,
    }
}

/// Update node state gauge
pub fn update_node_state(node_id: &str, status: NodeStatus) {
    set_node_state(node_id, Some(status));
}

/// Mark a node as no longer in the pool
pub fn clear_node_state(node_id: &str) {
    set_node_state(node_id, None);
}

fn set_node_state(node_id: &str, status: Option<NodeStatus>) {
    metrics::gauge!(
        "prism_client_node_state",
        "node_id" => node_id.to_string(),
    )
    .set(node_state_value(status));
}

/// Record pool size gauges
pub fn record_pool_size(total: usize, dead: usize) {
    metrics::gauge!("prism_client_nodes_total").set(total as f64);
    metrics::gauge!("prism_client_nodes_dead").set(dead as f64);
}

/// Record a sniff attempt
pub fn record_sniff(reason: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    metrics::counter!(
        "prism_client_sniffs_total",
        "reason" => reason.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Record a resurrection attempt
pub fn record_resurrection(strategy: &str, is_alive: bool) {
    let result = if is_alive { "alive" } else { "dead" };
    metrics::counter!(
        "prism_client_resurrections_total",
        "strategy" => strategy.to_string(),
        "result" => result.to_string(),
    )
    .increment(1);
}

/// Record the size of a physical multi-search request
pub fn record_msearch_batch(size: usize) {
    metrics::histogram!("prism_client_msearch_batch_size").record(size as f64);
}

/// Record sub-operations requeued after a 429
pub fn record_msearch_requeued(count: usize) {
    metrics::counter!("prism_client_msearch_requeued_total").increment(count as u64);
}

/// Guard for timing logical requests
pub struct RequestTimer {
    method: String,
    start: Instant,
}

impl RequestTimer {
    /// Start timing a request
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            start: Instant::now(),
        }
    }

    /// Record success and duration
    pub fn success(self) {
        record_request_duration(&self.method, self.start.elapsed());
        record_request_success(&self.method);
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        record_request_duration(&self.method, self.start.elapsed());
        record_request_error(&self.method, error_type);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use metrics::{
        Counter, CounterFn, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder,
        SharedString, Unit,
    };
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct NodeStateCell {
        node_id: String,
        values: Arc<Mutex<HashMap<String, f64>>>,
    }

    impl GaugeFn for NodeStateCell {
        fn increment(&self, value: f64) {
            *self.values.lock().entry(self.node_id.clone()).or_default() += value;
        }

        fn decrement(&self, value: f64) {
            *self.values.lock().entry(self.node_id.clone()).or_default() -= value;
        }

        fn set(&self, value: f64) {
            self.values.lock().insert(self.node_id.clone(), value);
        }
    }

    struct NoopCounter;

    impl CounterFn for NoopCounter {
        fn increment(&self, _value: u64) {}
        fn absolute(&self, _value: u64) {}
    }

    /// Recorder keeping the last `prism_client_node_state` value per node
    #[derive(Default)]
    pub(crate) struct NodeStateRecorder {
        values: Arc<Mutex<HashMap<String, f64>>>,
    }

    impl NodeStateRecorder {
        pub(crate) fn value(&self, node_id: &str) -> Option<f64> {
            self.values.lock().get(node_id).copied()
        }
    }

    impl Recorder for NodeStateRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _key: &Key, _metadata: &Metadata<'_>) -> Counter {
            Counter::from_arc(Arc::new(NoopCounter))
        }

        fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
            let node_id = key
                .labels()
                .find(|label| label.key() == "node_id")
                .map(|label| label.value().to_string());
            match node_id {
                Some(node_id) if key.name() == "prism_client_node_state" => {
                    Gauge::from_arc(Arc::new(NodeStateCell {
                        node_id,
                        values: self.values.clone(),
                    }))
                }
                _ => Gauge::noop(),
            }
        }

        fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_node_state_encoding() {
        assert_eq!(node_state_value(None), 0.0);
        assert_eq!(node_state_value(Some(NodeStatus::Alive)), 1.0);
        assert_eq!(node_state_value(Some(NodeStatus::Dead)), 2.0);

        let recorder = NodeStateRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            update_node_state("a", NodeStatus::Dead);
            update_node_state("b", NodeStatus::Alive);
            clear_node_state("b");
        });
        assert_eq!(recorder.value("a"), Some(2.0));
        assert_eq!(recorder.value("b"), Some(0.0));
    }

    #[test]
    fn test_request_timer() {
        let timer = RequestTimer::new("GET");
        std::thread::sleep(Duration::from_millis(1));
        timer.success();

        let timer = RequestTimer::new("POST");
        timer.error("connection");
    }

    #[test]
    fn test_state_recorders_without_exporter() {
        // Should not panic without an installed recorder
        update_node_state("http://localhost:9200/", NodeStatus::Dead);
        record_pool_size(3, 1);
        record_sniff("start", true);
        record_resurrection("ping", false);
        record_msearch_batch(5);
        record_msearch_requeued(2);
        record_retry("connection");
    }
}
