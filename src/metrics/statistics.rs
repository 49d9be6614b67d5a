use super::record::{Counter, Latency, MetricRecord};
use super::registry::MetricRegistry;
use std::sync::Arc;

/// Pipeline-level counters shared by the runner stages.
#[derive(Debug)]
pub struct PipelineStatistics {
    pub record: Arc<MetricRecord>,
    pub collect_latency: Arc<Latency>,
    pub raw_log: Arc<Counter>,
    pub split_log: Arc<Counter>,
    pub flush_log: Arc<Counter>,
    pub flush_loggroup: Arc<Counter>,
    pub flush_ready: Arc<Counter>,
    pub flush_latency: Arc<Latency>,
}

impl PipelineStatistics {
    pub fn new<K, V>(registry: &MetricRegistry, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let record = registry.register(labels);
        Self {
            collect_latency: record.latency("collect_latency"),
            raw_log: record.counter("raw_log"),
            split_log: record.counter("split_log"),
            flush_log: record.counter("flush_log"),
            flush_loggroup: record.counter("flush_loggroup"),
            flush_ready: record.counter("flush_ready"),
            flush_latency: record.latency("flush_latency"),
            record,
        }
    }
}
