//! `metric_self_statistics`: turns the metric records of every live pipeline
//! into records, one per snapshot.

use crate::metrics::MetricSnapshot;
use crate::model::{Event, GroupEvents, GroupInfo, Record, RecordContext};
use crate::plugin::{
    Collector, ContractVersion, GroupCollector, MetricInputV1, MetricInputV2, PluginContext,
    PluginError, PluginInstance, PluginRegistry,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

pub const SELF_STATISTICS_INPUT: &str = "metric_self_statistics";

/// Topic of the produced records.
pub const STATISTICS_TOPIC: &str = "__metric__";

/// Read access to the metric records of all live pipelines.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn export_all(&self) -> Vec<MetricSnapshot>;
}

fn snapshot_record(snapshot: &MetricSnapshot) -> Record {
    let mut record = Record::new();
    for (key, value) in &snapshot.labels {
        record.push(format!("label.{}", key), value.clone());
    }
    for (key, value) in &snapshot.values {
        record.push(format!("value.{}", key), value.to_string());
    }
    record.stamp_if_zero(SystemTime::now());
    record
}

pub struct SelfStatistics {
    source: Arc<dyn MetricsSource>,
}

impl SelfStatistics {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl MetricInputV1 for SelfStatistics {
    fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
        Ok(0)
    }

    fn description(&self) -> String {
        "self statistics input".to_string()
    }

    async fn collect(&mut self, collector: &dyn Collector) -> Result<(), PluginError> {
        for snapshot in self.source.export_all().await {
            let context = RecordContext {
                topic: Some(STATISTICS_TOPIC.to_string()),
                ..RecordContext::default()
            };
            collector.add_record(snapshot_record(&snapshot), context).await;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricInputV2 for SelfStatistics {
    fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
        Ok(0)
    }

    fn description(&self) -> String {
        "self statistics input v2".to_string()
    }

    async fn read(&mut self, collector: &dyn GroupCollector) -> Result<(), PluginError> {
        let now = SystemTime::now();
        let events: Vec<Event> = self
            .source
            .export_all()
            .await
            .iter()
            .map(|snapshot| Event::from_record(snapshot_record(snapshot), now))
            .collect();
        if events.is_empty() {
            return Ok(());
        }
        let mut group = GroupInfo::default();
        group
            .metadata
            .insert(crate::model::META_TOPIC.to_string(), STATISTICS_TOPIC.to_string());
        collector.collect(GroupEvents::new(group, events)).await;
        Ok(())
    }
}

pub fn register(registry: &mut PluginRegistry, source: Arc<dyn MetricsSource>) {
    registry.register(SELF_STATISTICS_INPUT, move |version, _| {
        let input = SelfStatistics::new(source.clone());
        Ok(match version {
            ContractVersion::V1 => PluginInstance::MetricInputV1(Box::new(input)),
            ContractVersion::V2 => PluginInstance::MetricInputV2(Box::new(input)),
        })
    });
}
