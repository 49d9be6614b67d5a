//! Synthetic inputs: `metric_mock` emits one record per tick, `service_mock`
//! pushes records from its own loop.

use crate::model::{Event, GroupEvents, GroupInfo, Record, RecordContext, BODY_KEY};
use crate::plugin::{
    decode_detail, Collector, ContractVersion, GroupCollector, MetricInputV1, MetricInputV2,
    PluginContext, PluginError, PluginInstance, PluginRegistry, ServiceInputV1, ServiceInputV2,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const METRIC_MOCK: &str = "metric_mock";
pub const SERVICE_MOCK: &str = "service_mock";

/// Key of the per-plugin sequence number added to every record.
pub const INDEX_KEY: &str = "__index__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MockDetail {
    pub fields: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    /// Stop after this many records; 0 means unbounded.
    pub count: u64,
    /// Pause between records of `service_mock`.
    pub interval_ms: u64,
    /// Add `__index__` to every record.
    pub with_index: bool,
}

impl MockDetail {
    fn record(&self, index: u64) -> (Record, RecordContext) {
        let mut record: Record = self.fields.iter().collect();
        if self.with_index {
            record.push(INDEX_KEY, index.to_string());
        }
        let context = RecordContext {
            tags: self
                .tags
                .iter()
                .map(|(k, v)| crate::model::LogTag::new(k, v))
                .collect(),
            ..RecordContext::default()
        };
        (record, context)
    }

    fn group(&self, index: u64) -> GroupEvents {
        let mut event = Event::default();
        for (key, value) in &self.fields {
            if key == BODY_KEY {
                event.body = value.clone();
            } else {
                event.contents.insert(key.clone(), value.clone());
            }
        }
        if self.with_index {
            event.contents.insert(INDEX_KEY.to_string(), index.to_string());
        }
        event.stamp_if_zero(SystemTime::now());
        let group = GroupInfo {
            tags: self.tags.clone(),
            ..GroupInfo::default()
        };
        GroupEvents::new(group, vec![event])
    }

    fn exhausted(&self, index: u64) -> bool {
        self.count > 0 && index >= self.count
    }
}

pub struct MetricMock {
    detail: MockDetail,
    index: u64,
}

impl MetricMock {
    pub fn new(detail: MockDetail) -> Self {
        Self { detail, index: 0 }
    }
}

#[async_trait]
impl MetricInputV1 for MetricMock {
    fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
        Ok(0)
    }

    fn description(&self) -> String {
        "mock metric input".to_string()
    }

    async fn collect(&mut self, collector: &dyn Collector) -> Result<(), PluginError> {
        if self.detail.exhausted(self.index) {
            return Ok(());
        }
        let (record, context) = self.detail.record(self.index);
        self.index += 1;
        collector.add_record(record, context).await;
        Ok(())
    }
}

#[async_trait]
impl MetricInputV2 for MetricMock {
    fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
        Ok(0)
    }

    fn description(&self) -> String {
        "mock metric input v2".to_string()
    }

    async fn read(&mut self, collector: &dyn GroupCollector) -> Result<(), PluginError> {
        if self.detail.exhausted(self.index) {
            return Ok(());
        }
        let group = self.detail.group(self.index);
        self.index += 1;
        collector.collect(group).await;
        Ok(())
    }
}

/// Emits `Count` records (forever when 0), `IntervalMs` apart, until stopped.
pub struct ServiceMock {
    detail: MockDetail,
    shutdown: CancellationToken,
}

impl ServiceMock {
    pub fn new(detail: MockDetail) -> Self {
        Self {
            detail,
            shutdown: CancellationToken::new(),
        }
    }

    async fn pace(&self) -> bool {
        if self.detail.interval_ms == 0 {
            tokio::task::yield_now().await;
            return !self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(self.detail.interval_ms)) => true,
        }
    }
}

#[async_trait]
impl ServiceInputV1 for ServiceMock {
    fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
        Ok(0)
    }

    fn description(&self) -> String {
        "mock service input".to_string()
    }

    async fn start(&self, collector: Arc<dyn Collector>) -> Result<(), PluginError> {
        let mut index = 0;
        while !self.detail.exhausted(index) && !self.shutdown.is_cancelled() {
            let (record, context) = self.detail.record(index);
            collector.add_record(record, context).await;
            index += 1;
            if !self.pace().await {
                break;
            }
        }
        debug!(emitted = index, "mock service finished");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.shutdown.cancel();
        Ok(())
    }
}

#[async_trait]
impl ServiceInputV2 for ServiceMock {
    fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
        Ok(0)
    }

    fn description(&self) -> String {
        "mock service input v2".to_string()
    }

    async fn start_service(&self, collector: Arc<dyn GroupCollector>) -> Result<(), PluginError> {
        let mut index = 0;
        while !self.detail.exhausted(index) && !self.shutdown.is_cancelled() {
            collector.collect(self.detail.group(index)).await;
            index += 1;
            if !self.pace().await {
                break;
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.shutdown.cancel();
        Ok(())
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(METRIC_MOCK, |version, detail| {
        let detail: MockDetail = decode_detail(METRIC_MOCK, detail)?;
        Ok(match version {
            ContractVersion::V1 => PluginInstance::MetricInputV1(Box::new(MetricMock::new(detail))),
            ContractVersion::V2 => PluginInstance::MetricInputV2(Box::new(MetricMock::new(detail))),
        })
    });
    registry.register(SERVICE_MOCK, |version, detail| {
        let detail: MockDetail = decode_detail(SERVICE_MOCK, detail)?;
        Ok(match version {
            ContractVersion::V1 => {
                PluginInstance::ServiceInputV1(Box::new(ServiceMock::new(detail)))
            }
            ContractVersion::V2 => {
                PluginInstance::ServiceInputV2(Box::new(ServiceMock::new(detail)))
            }
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink(Mutex<Vec<(Record, RecordContext)>>);

    #[async_trait]
    impl Collector for Sink {
        async fn add_record(&self, record: Record, context: RecordContext) {
            self.0.lock().unwrap().push((record, context));
        }

        fn try_add_record(&self, record: Record, context: RecordContext) -> Result<(), PluginError> {
            self.0.lock().unwrap().push((record, context));
            Ok(())
        }
    }

    fn detail(count: u64) -> MockDetail {
        serde_json::from_value(serde_json::json!({
            "Fields": {"content": "hello"},
            "Tags": {"pod": "web-1"},
            "Count": count,
            "WithIndex": true
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_metric_mock_respects_count() {
        let mut mock = MetricMock::new(detail(2));
        let sink = Sink::default();
        for _ in 0..5 {
            MetricInputV1::collect(&mut mock, &sink).await.unwrap();
        }
        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0.get(INDEX_KEY), Some("1"));
        assert_eq!(records[0].0.get("content"), Some("hello"));
        assert_eq!(records[0].1.tags[0].key, "pod");
    }

    #[tokio::test]
    async fn test_service_mock_stops_when_asked() {
        let mut unbounded = detail(0);
        unbounded.interval_ms = 5;
        let mock = Arc::new(ServiceMock::new(unbounded));
        let sink: Arc<Sink> = Arc::new(Sink::default());

        let running = tokio::spawn({
            let mock = mock.clone();
            let sink: Arc<dyn Collector> = sink.clone();
            async move { ServiceInputV1::start(mock.as_ref(), sink).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        ServiceInputV1::stop(mock.as_ref()).await.unwrap();
        running.await.unwrap().unwrap();
        assert!(!sink.0.lock().unwrap().is_empty());
    }
}
