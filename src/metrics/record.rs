use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic int64 counter.
///
/// All operations use relaxed ordering; readers may observe slightly stale
/// values.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    #[inline]
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Last-value float gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    #[inline]
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Accumulated latency observations.
///
/// Either call [`Latency::observe`] with a measured duration, or bracket the
/// work with [`Latency::begin`] and [`Latency::end`].
#[derive(Debug, Default)]
pub struct Latency {
    count: AtomicU64,
    total_ns: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl Latency {
    pub fn begin(&self) {
        if let Ok(mut started) = self.started.lock() {
            *started = Some(Instant::now());
        }
    }

    pub fn end(&self) {
        let started = self.started.lock().ok().and_then(|mut s| s.take());
        if let Some(started) = started {
            self.observe(started.elapsed());
        }
    }

    #[inline]
    pub fn observe(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }

    /// Mean observation in milliseconds, 0 when nothing was observed.
    pub fn average_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.total().as_secs_f64() * 1000.0 / count as f64
    }

    pub fn clear(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Latency(Arc<Latency>),
}

impl Metric {
    fn value(&self) -> f64 {
        match self {
            Metric::Counter(c) => c.get() as f64,
            Metric::Gauge(g) => g.get(),
            Metric::Latency(l) => l.average_ms(),
        }
    }
}

/// A set of metrics under one immutable label set.
#[derive(Debug)]
pub struct MetricRecord {
    labels: BTreeMap<String, String>,
    metrics: Mutex<BTreeMap<String, Metric>>,
}

/// Point-in-time export of one [`MetricRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub labels: BTreeMap<String, String>,
    pub values: BTreeMap<String, f64>,
}

impl MetricRecord {
    pub fn new<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            metrics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Get or register a counter. A name already bound to another metric kind
    /// is rebound to a fresh counter.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut metrics = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(Metric::Counter(c)) = metrics.get(name) {
            return c.clone();
        }
        let counter = Arc::new(Counter::default());
        metrics.insert(name.to_string(), Metric::Counter(counter.clone()));
        counter
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let mut metrics = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(Metric::Gauge(g)) = metrics.get(name) {
            return g.clone();
        }
        let gauge = Arc::new(Gauge::default());
        metrics.insert(name.to_string(), Metric::Gauge(gauge.clone()));
        gauge
    }

    pub fn latency(&self, name: &str) -> Arc<Latency> {
        let mut metrics = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(Metric::Latency(l)) = metrics.get(name) {
            return l.clone();
        }
        let latency = Arc::new(Latency::default());
        metrics.insert(name.to_string(), Metric::Latency(latency.clone()));
        latency
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        let values = match self.metrics.lock() {
            Ok(m) => m.iter().map(|(k, m)| (k.clone(), m.value())).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, m)| (k.clone(), m.value()))
                .collect(),
        };
        MetricSnapshot {
            labels: self.labels.clone(),
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_and_clear() {
        let counter = Counter::default();
        counter.add(3);
        counter.add(4);
        assert_eq!(counter.get(), 7);
        counter.clear();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_latency_average() {
        let latency = Latency::default();
        latency.observe(Duration::from_millis(10));
        latency.observe(Duration::from_millis(30));
        assert_eq!(latency.count(), 2);
        assert!((latency.average_ms() - 20.0).abs() < 1e-9);

        latency.begin();
        latency.end();
        assert_eq!(latency.count(), 3);
    }

    #[test]
    fn test_record_returns_same_metric_for_name() {
        let record = MetricRecord::new([("plugin_type", "flusher_stdout")]);
        record.counter("proc_in_records_total").add(2);
        record.counter("proc_in_records_total").add(3);
        record.gauge("queue_fill").set(0.5);

        let snapshot = record.snapshot();
        assert_eq!(snapshot.values["proc_in_records_total"], 5.0);
        assert_eq!(snapshot.values["queue_fill"], 0.5);
        assert_eq!(snapshot.labels["plugin_type"], "flusher_stdout");
    }

    #[test]
    fn test_concurrent_adds() {
        let record = Arc::new(MetricRecord::new(Vec::<(String, String)>::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let record = record.clone();
                std::thread::spawn(move || {
                    let counter = record.counter("n");
                    for _ in 0..1000 {
                        counter.add(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(record.counter("n").get(), 4000);
    }
}
