//! Latency and count taps emitted around every seal operation.
//!
//! Metric keys are paths such as `["seal", "encrypt", "time"]`. The Prometheus
//! sink joins the segments with `_` and registers each metric on first use.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Process-wide registry used by [`default_sink`].
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static DEFAULT_SINK: Lazy<Arc<PrometheusSink>> =
    Lazy::new(|| Arc::new(PrometheusSink::new(REGISTRY.clone())));

/// Receives latency samples and counter increments.
pub trait MetricsSink: Send + Sync {
    /// Records the time elapsed since `start` under `key`.
    fn measure_since(&self, key: &[&str], start: Instant);

    /// Adds `value` to the counter under `key`.
    fn incr_counter(&self, key: &[&str], value: u64);
}

/// Returns the sink backed by [`REGISTRY`].
#[must_use]
pub fn default_sink() -> Arc<dyn MetricsSink> {
    DEFAULT_SINK.clone()
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn measure_since(&self, _key: &[&str], _start: Instant) {}

    fn incr_counter(&self, _key: &[&str], _value: u64) {}
}

/// Prometheus-backed sink. Histograms observe seconds.
pub struct PrometheusSink {
    registry: Registry,
    histograms: Mutex<HashMap<String, Histogram>>,
    counters: Mutex<HashMap<String, IntCounter>>,
}

impl PrometheusSink {
    /// Creates a sink registering into `registry`.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            histograms: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the registry metrics are registered into.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    fn histogram(&self, name: String) -> Option<Histogram> {
        let mut histograms = self.histograms.lock();
        if let Some(h) = histograms.get(&name) {
            return Some(h.clone());
        }
        let help = format!("latency of {}", name.replace('_', " "));
        let h = Histogram::with_opts(HistogramOpts::new(name.clone(), help))
            .and_then(|h| self.registry.register(Box::new(h.clone())).map(|()| h));
        match h {
            Ok(h) => {
                histograms.insert(name, h.clone());
                Some(h)
            }
            Err(err) => {
                tracing::warn!(metric = %name, error = %err, "failed to register histogram");
                None
            }
        }
    }

    fn counter(&self, name: String) -> Option<IntCounter> {
        let mut counters = self.counters.lock();
        if let Some(c) = counters.get(&name) {
            return Some(c.clone());
        }
        let help = format!("count of {}", name.replace('_', " "));
        let c = IntCounter::with_opts(Opts::new(name.clone(), help))
            .and_then(|c| self.registry.register(Box::new(c.clone())).map(|()| c));
        match c {
            Ok(c) => {
                counters.insert(name, c.clone());
                Some(c)
            }
            Err(err) => {
                tracing::warn!(metric = %name, error = %err, "failed to register counter");
                None
            }
        }
    }
}

impl MetricsSink for PrometheusSink {
    fn measure_since(&self, key: &[&str], start: Instant) {
        if let Some(h) = self.histogram(metric_name(key)) {
            h.observe(start.elapsed().as_secs_f64());
        }
    }

    fn incr_counter(&self, key: &[&str], value: u64) {
        if let Some(c) = self.counter(metric_name(key)) {
            c.inc_by(value);
        }
    }
}

/// Joins key segments into a valid Prometheus metric name.
#[must_use]
pub fn metric_name(key: &[&str]) -> String {
    key.iter()
        .map(|segment| {
            segment
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_counter().get_value())
    }

    fn histogram_count(registry: &Registry, name: &str) -> Option<u64> {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_histogram().get_sample_count())
    }

    #[test]
    fn test_metric_name() {
        assert_eq!(metric_name(&["seal", "encrypt", "time"]), "seal_encrypt_time");
        assert_eq!(metric_name(&["seal", "local-disk", "decrypt"]), "seal_local_disk_decrypt");
    }

    #[test]
    fn test_prometheus_counter_accumulates() {
        let sink = PrometheusSink::new(Registry::new());
        sink.incr_counter(&["seal", "encrypt"], 1);
        sink.incr_counter(&["seal", "encrypt"], 2);

        assert_eq!(counter_value(sink.registry(), "seal_encrypt"), Some(3.0));
    }

    #[test]
    fn test_prometheus_histogram_records_samples() {
        let sink = PrometheusSink::new(Registry::new());
        let start = Instant::now();
        sink.measure_since(&["seal", "decrypt", "time"], start);
        sink.measure_since(&["seal", "decrypt", "time"], start);

        assert_eq!(histogram_count(sink.registry(), "seal_decrypt_time"), Some(2));
    }

    #[test]
    fn test_noop_sink_accepts_everything() {
        let sink = NoopSink;
        sink.incr_counter(&["seal", "encrypt"], 1);
        sink.measure_since(&["seal", "encrypt", "time"], Instant::now());
    }
}
