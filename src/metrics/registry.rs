use super::record::{MetricRecord, MetricSnapshot};
use std::sync::{Arc, RwLock};

/// The metric records of one pipeline.
///
/// Registration takes the write lock; the hot path only touches the atomic
/// metrics inside a record and never locks the registry.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    records: RwLock<Vec<Arc<MetricRecord>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record with `labels` and add it to the export set.
    pub fn register<K, V>(&self, labels: impl IntoIterator<Item = (K, V)>) -> Arc<MetricRecord>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let record = Arc::new(MetricRecord::new(labels));
        self.add(record.clone());
        record
    }

    /// Add an externally built record. Adding the same record twice is a no-op.
    pub fn add(&self, record: Arc<MetricRecord>) {
        let mut records = match self.records.write() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !records.iter().any(|r| Arc::ptr_eq(r, &record)) {
            records.push(record);
        }
    }

    pub fn remove(&self, record: &Arc<MetricRecord>) {
        let mut records = match self.records.write() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.retain(|r| !Arc::ptr_eq(r, record));
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn export(&self) -> Vec<MetricSnapshot> {
        match self.records.read() {
            Ok(records) => records.iter().map(|r| r.snapshot()).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|r| r.snapshot())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let registry = MetricRegistry::new();
        let a = registry.register([("plugin_id", "1")]);
        let b = registry.register([("plugin_id", "2")]);
        a.counter("proc_in_records_total").add(1);

        registry.add(a.clone());
        assert_eq!(registry.len(), 2);

        registry.remove(&b);
        let exported = registry.export();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].labels["plugin_id"], "1");
        assert_eq!(exported[0].values["proc_in_records_total"], 1.0);
    }
}
