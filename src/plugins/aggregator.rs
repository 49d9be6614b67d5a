//! `aggregator_default`: packs records into batches keyed by their sidecar.

use crate::model::{Batch, GroupEvents, Record, RecordContext};
use crate::pipeline::TopicFormat;
use crate::plugin::{
    decode_detail, AggregatorV1, AggregatorV2, ContractVersion, GroupQueue, LogGroupQueue,
    PluginContext, PluginError, PluginInstance, PluginRegistry,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const AGGREGATOR_DEFAULT: &str = "aggregator_default";

pub const DEFAULT_MAX_LOG_COUNT: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AggregatorDetail {
    pub max_log_count: usize,
    /// Topic template; empty keeps the topic carried by the record.
    pub topic: String,
}

impl Default for AggregatorDetail {
    fn default() -> Self {
        Self {
            max_log_count: DEFAULT_MAX_LOG_COUNT,
            topic: String::new(),
        }
    }
}

impl AggregatorDetail {
    fn max_log_count(&self) -> usize {
        self.max_log_count.max(1)
    }
}

/// One open batch per distinct (source, topic, tags). A batch reaching
/// `MaxLogCount` is handed to the flush queue on the next add; the timer
/// flush collects whatever is still open.
pub struct DefaultAggregator {
    detail: AggregatorDetail,
    topic: Option<TopicFormat>,
    queue: Option<Arc<dyn LogGroupQueue>>,
    // Insertion order of keys, so flushes keep the arrival order of batches.
    order: Vec<String>,
    open: HashMap<String, Batch>,
}

impl DefaultAggregator {
    pub fn new(detail: AggregatorDetail) -> Self {
        let topic = (!detail.topic.is_empty()).then(|| TopicFormat::new(&detail.topic));
        Self {
            detail,
            topic,
            queue: None,
            order: Vec::new(),
            open: HashMap::new(),
        }
    }

    fn topic_for(&self, record: &Record, context: &RecordContext) -> String {
        match &self.topic {
            Some(format) => format.format(record),
            None => context.topic.clone().unwrap_or_default(),
        }
    }

    fn new_batch(topic: String, context: &RecordContext) -> Batch {
        Batch {
            topic,
            source: context.source.clone().unwrap_or_default(),
            tags: context.tags.clone(),
            logs: Vec::new(),
        }
    }
}

impl AggregatorV1 for DefaultAggregator {
    fn init(
        &mut self,
        _ctx: &PluginContext,
        queue: Arc<dyn LogGroupQueue>,
    ) -> Result<u64, PluginError> {
        self.queue = Some(queue);
        Ok(0)
    }

    fn description(&self) -> String {
        format!("default aggregator (max {} records)", self.detail.max_log_count())
    }

    fn add(&mut self, record: &Record, context: &RecordContext) -> Result<(), PluginError> {
        let topic = self.topic_for(record, context);
        let mut key = context.group_key();
        if self.topic.as_ref().is_some_and(|f| !f.is_static()) {
            key.push('#');
            key.push_str(&topic);
        }

        let max = self.detail.max_log_count();
        if let (Some(batch), Some(queue)) = (self.open.get_mut(&key), &self.queue) {
            if batch.len() >= max {
                // The open batch stays intact on failure; the caller retries
                // this record.
                queue.add(batch.clone())?;
                batch.logs.clear();
            }
        }
        match self.open.get_mut(&key) {
            Some(batch) => batch.logs.push(record.clone()),
            None => {
                let mut batch = Self::new_batch(topic, context);
                batch.logs.push(record.clone());
                self.order.push(key.clone());
                self.open.insert(key, batch);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Vec<Batch> {
        let mut batches = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            if let Some(batch) = self.open.remove(&key) {
                if !batch.is_empty() {
                    batches.push(batch);
                }
            }
        }
        batches
    }

    fn reset(&mut self) {
        self.order.clear();
        self.open.clear();
    }
}

/// Group-events counterpart: events are merged into one group per distinct
/// metadata and tags.
pub struct DefaultAggregatorV2 {
    detail: AggregatorDetail,
    queue: Option<Arc<dyn GroupQueue>>,
    order: Vec<String>,
    open: HashMap<String, GroupEvents>,
}

impl DefaultAggregatorV2 {
    pub fn new(detail: AggregatorDetail) -> Self {
        Self {
            detail,
            queue: None,
            order: Vec::new(),
            open: HashMap::new(),
        }
    }

    fn key(group: &GroupEvents) -> String {
        let mut key = String::new();
        for (k, v) in group.group.metadata.iter().chain(group.group.tags.iter()) {
            key.push_str(k);
            key.push('=');
            key.push_str(v);
            key.push('|');
        }
        key
    }
}

impl AggregatorV2 for DefaultAggregatorV2 {
    fn init(&mut self, _ctx: &PluginContext, queue: Arc<dyn GroupQueue>) -> Result<u64, PluginError> {
        self.queue = Some(queue);
        Ok(0)
    }

    fn description(&self) -> String {
        format!("default aggregator v2 (max {} events)", self.detail.max_log_count())
    }

    fn record(&mut self, group: &GroupEvents) -> Result<(), PluginError> {
        let key = Self::key(group);
        let max = self.detail.max_log_count();
        if let (Some(open), Some(queue)) = (self.open.get_mut(&key), &self.queue) {
            if open.len() >= max {
                queue.add(open.clone())?;
                open.events.clear();
            }
        }
        match self.open.get_mut(&key) {
            Some(open) => open.events.extend(group.events.iter().cloned()),
            None => {
                self.order.push(key.clone());
                self.open.insert(key, group.clone());
            }
        }
        Ok(())
    }

    fn get_result(&mut self) -> Vec<GroupEvents> {
        let mut groups = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            if let Some(group) = self.open.remove(&key) {
                if !group.is_empty() {
                    groups.push(group);
                }
            }
        }
        groups
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(AGGREGATOR_DEFAULT, |version, detail| {
        let detail: AggregatorDetail = decode_detail(AGGREGATOR_DEFAULT, detail)?;
        Ok(match version {
            ContractVersion::V1 => {
                PluginInstance::AggregatorV1(Box::new(DefaultAggregator::new(detail)))
            }
            ContractVersion::V2 => {
                PluginInstance::AggregatorV2(Box::new(DefaultAggregatorV2::new(detail)))
            }
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::model::{Event, GroupInfo, LogTag};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// A flush queue holding at most `capacity` batches.
    struct BoundedQueue {
        capacity: usize,
        batches: Mutex<Vec<Batch>>,
    }

    #[async_trait]
    impl LogGroupQueue for BoundedQueue {
        fn add(&self, batch: Batch) -> Result<(), PluginError> {
            let mut batches = self.batches.lock().unwrap();
            if batches.len() >= self.capacity {
                return Err(PluginError::QueueFull);
            }
            batches.push(batch);
            Ok(())
        }

        async fn add_with_wait(&self, batch: Batch, _wait: Duration) -> Result<(), PluginError> {
            self.add(batch)
        }
    }

    fn aggregator(detail: AggregatorDetail, capacity: usize) -> (DefaultAggregator, Arc<BoundedQueue>) {
        let queue = Arc::new(BoundedQueue {
            capacity,
            batches: Mutex::new(Vec::new()),
        });
        let mut agg = DefaultAggregator::new(detail);
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::new()));
        agg.init(&ctx, queue.clone()).unwrap();
        (agg, queue)
    }

    fn record(n: usize) -> Record {
        let mut r: Record = [("content", n.to_string())].into_iter().collect();
        r.time = 1_700_000_000;
        r
    }

    #[test]
    fn test_groups_by_context() {
        let (mut agg, _) = aggregator(AggregatorDetail::default(), 4);
        let a = RecordContext::with_source("a");
        let b = RecordContext {
            source: Some("a".into()),
            tags: vec![LogTag::new("pod", "x")],
            ..RecordContext::default()
        };
        agg.add(&record(1), &a).unwrap();
        agg.add(&record(2), &b).unwrap();
        agg.add(&record(3), &a).unwrap();

        let batches = agg.flush();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0].source, "a");
        assert_eq!(batches[1].tags, vec![LogTag::new("pod", "x")]);
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_full_batch_is_handed_off_in_order() {
        let detail = AggregatorDetail {
            max_log_count: 2,
            ..AggregatorDetail::default()
        };
        let (mut agg, queue) = aggregator(detail, 1);
        let ctx = RecordContext::default();
        agg.add(&record(0), &ctx).unwrap();
        agg.add(&record(1), &ctx).unwrap();
        agg.add(&record(2), &ctx).unwrap();
        assert_eq!(queue.batches.lock().unwrap()[0].len(), 2);

        agg.add(&record(3), &ctx).unwrap();
        // The queue is full now: the record must not be consumed.
        assert!(matches!(agg.add(&record(4), &ctx), Err(PluginError::QueueFull)));
        let open = agg.flush();
        assert_eq!(open.len(), 1);
        let contents: Vec<_> = open[0].logs.iter().map(|r| r.get("content").unwrap()).collect();
        assert_eq!(contents, vec!["2", "3"]);
    }

    #[test]
    fn test_dynamic_topic_splits_batches() {
        let detail = AggregatorDetail {
            topic: "svc-%{service}".into(),
            ..AggregatorDetail::default()
        };
        let (mut agg, _) = aggregator(detail, 1);
        let ctx = RecordContext::default();
        let mut a = record(0);
        a.push("service", "billing");
        let mut b = record(1);
        b.push("service", "auth");
        agg.add(&a, &ctx).unwrap();
        agg.add(&b, &ctx).unwrap();

        let topics: Vec<_> = agg.flush().into_iter().map(|b| b.topic).collect();
        assert_eq!(topics, vec!["svc-billing", "svc-auth"]);
    }

    #[test]
    fn test_v2_merges_groups() {
        let mut agg = DefaultAggregatorV2::new(AggregatorDetail::default());
        let mut info = GroupInfo::default();
        info.tags.insert("pod".into(), "x".into());
        let group = GroupEvents::new(info, vec![Event::with_body("a")]);
        agg.record(&group).unwrap();
        agg.record(&group).unwrap();
        agg.record(&GroupEvents::new(GroupInfo::default(), vec![Event::with_body("b")]))
            .unwrap();

        let result = agg.get_result();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].len(), 2);
        assert!(agg.get_result().is_empty());
    }
}
