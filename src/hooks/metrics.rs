use std::sync::Arc;

use super::Registry;
use crate::error::EmptyResult;

/// Counter and gauge sink. Backends aggregate however they like; tags are
/// low-cardinality key/value pairs.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, metric_name: &str, value: f64, tags: &[(&str, &str)]) -> EmptyResult;
    fn record_gauge(&self, metric_name: &str, value: f64, tags: &[(&str, &str)]) -> EmptyResult;
}

static SINKS: Registry<dyn MetricsSink> = Registry::new("metrics");

pub fn register(sink: Arc<dyn MetricsSink>) {
    SINKS.register(sink);
}

pub fn record_counter(metric_name: &str, value: f64, tags: &[(&str, &str)]) {
    SINKS.dispatch("record_counter", |h| h.record_counter(metric_name, value, tags));
}

pub fn increment(metric_name: &str, tags: &[(&str, &str)]) {
    record_counter(metric_name, 1.0, tags);
}

pub fn record_gauge(metric_name: &str, value: f64, tags: &[(&str, &str)]) {
    SINKS.dispatch("record_gauge", |h| h.record_gauge(metric_name, value, tags));
}

/// The built-in sink logs at debug, useful when eyeballing a dev instance
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record_counter(&self, metric_name: &str, value: f64, tags: &[(&str, &str)]) -> EmptyResult {
        debug!(target: "accessward::metrics", "counter {metric_name} += {value} {tags:?}");
        Ok(())
    }

    fn record_gauge(&self, metric_name: &str, value: f64, tags: &[(&str, &str)]) -> EmptyResult {
        debug!(target: "accessward::metrics", "gauge {metric_name} = {value} {tags:?}");
        Ok(())
    }
}
