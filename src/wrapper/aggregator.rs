use super::guard_sync;
use super::timer::random_sleep;
use crate::metrics::{
    Counter, MetricRecord, PROC_IN_RECORDS_TOTAL, PROC_OUT_RECORDS_TOTAL, PROC_TIME_MS,
};
use crate::model::{Batch, GroupEvents, Record, RecordContext};
use crate::plugin::{
    AggregatorV1, AggregatorV2, GroupQueue, LogGroupQueue, PluginContext, PluginError, PluginMeta,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The flush queue endpoint a v1 aggregator enqueues to.
pub struct BatchQueue {
    queue: mpsc::Sender<Batch>,
    out_records: Arc<Counter>,
}

impl BatchQueue {
    fn new(queue: mpsc::Sender<Batch>, record: &MetricRecord) -> Self {
        Self {
            queue,
            out_records: record.counter(PROC_OUT_RECORDS_TOTAL),
        }
    }

    /// Blocking enqueue used by the timer; cadence provides the backpressure.
    async fn send(&self, batch: Batch) {
        let records = batch.len() as i64;
        if self.queue.send(batch).await.is_ok() {
            self.out_records.add(records);
        } else {
            debug!("flush queue closed, batch dropped");
        }
    }
}

#[async_trait]
impl LogGroupQueue for BatchQueue {
    fn add(&self, batch: Batch) -> Result<(), PluginError> {
        let records = batch.len() as i64;
        match self.queue.try_send(batch) {
            Ok(()) => {
                self.out_records.add(records);
                Ok(())
            }
            Err(_) => Err(PluginError::QueueFull),
        }
    }

    async fn add_with_wait(&self, batch: Batch, wait: Duration) -> Result<(), PluginError> {
        let records = batch.len() as i64;
        match self.queue.send_timeout(batch, wait).await {
            Ok(()) => {
                self.out_records.add(records);
                Ok(())
            }
            Err(_) => Err(PluginError::QueueFull),
        }
    }
}

/// The flush queue endpoint a v2 aggregator enqueues to.
pub struct EventGroupQueue {
    queue: mpsc::Sender<GroupEvents>,
    out_records: Arc<Counter>,
}

impl EventGroupQueue {
    fn new(queue: mpsc::Sender<GroupEvents>, record: &MetricRecord) -> Self {
        Self {
            queue,
            out_records: record.counter(PROC_OUT_RECORDS_TOTAL),
        }
    }

    async fn send(&self, group: GroupEvents) {
        let events = group.len() as i64;
        if self.queue.send(group).await.is_ok() {
            self.out_records.add(events);
        } else {
            debug!("flush queue closed, group dropped");
        }
    }
}

#[async_trait]
impl GroupQueue for EventGroupQueue {
    fn add(&self, group: GroupEvents) -> Result<(), PluginError> {
        let events = group.len() as i64;
        match self.queue.try_send(group) {
            Ok(()) => {
                self.out_records.add(events);
                Ok(())
            }
            Err(_) => Err(PluginError::QueueFull),
        }
    }

    async fn add_with_wait(&self, group: GroupEvents, wait: Duration) -> Result<(), PluginError> {
        let events = group.len() as i64;
        match self.queue.send_timeout(group, wait).await {
            Ok(()) => {
                self.out_records.add(events);
                Ok(())
            }
            Err(_) => Err(PluginError::QueueFull),
        }
    }
}

fn effective_interval(configured: Duration, override_ms: u64) -> Duration {
    if override_ms > 0 {
        Duration::from_millis(override_ms)
    } else {
        configured
    }
}

pub struct AggregatorWrapperV1 {
    pub meta: PluginMeta,
    description: String,
    aggregator: Mutex<Box<dyn AggregatorV1>>,
    queue: Arc<BatchQueue>,
    interval: Duration,
    in_records: Arc<Counter>,
    proc_time_ms: Arc<Counter>,
}

impl AggregatorWrapperV1 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut aggregator: Box<dyn AggregatorV1>,
        interval: Duration,
        flush_queue: mpsc::Sender<Batch>,
    ) -> Result<Self, PluginError> {
        let description = aggregator.description();
        let record = ctx.register_metric_record(ctx.plugin_labels(&meta));
        let queue = Arc::new(BatchQueue::new(flush_queue, &record));
        let plugin_queue: Arc<dyn LogGroupQueue> = queue.clone();
        let override_ms = guard_sync(&description, || aggregator.init(ctx, plugin_queue))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        Ok(Self {
            in_records: record.counter(PROC_IN_RECORDS_TOTAL),
            proc_time_ms: record.counter(PROC_TIME_MS),
            interval: effective_interval(interval, override_ms),
            aggregator: Mutex::new(aggregator),
            description,
            queue,
            meta,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Hand one record to the aggregator. `QueueFull` means "retry later".
    pub async fn add(&self, record: &Record, context: &RecordContext) -> Result<(), PluginError> {
        let mut aggregator = self.aggregator.lock().await;
        let started = Instant::now();
        let outcome = guard_sync(&self.description, || aggregator.add(record, context));
        self.proc_time_ms.add(started.elapsed().as_millis() as i64);
        match outcome {
            Some(Ok(())) => {
                self.in_records.add(1);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush and forward while holding the plugin lock, so batches handed
    /// off by `add` cannot overtake the ones returned here.
    async fn flush_to_queue(&self) {
        let mut aggregator = self.aggregator.lock().await;
        let started = Instant::now();
        let batches = guard_sync(&self.description, || aggregator.flush()).unwrap_or_default();
        self.proc_time_ms.add(started.elapsed().as_millis() as i64);
        for batch in batches {
            if !batch.is_empty() {
                self.queue.send(batch).await;
            }
        }
    }

    /// Flush on every tick; after cancellation flush one final time and return.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(plugin = %self.meta.plugin_type_with_id, interval = ?self.interval, "aggregator started");
        loop {
            let exit = random_sleep(self.interval, &token).await;
            self.flush_to_queue().await;
            if exit {
                break;
            }
        }
        debug!(plugin = %self.meta.plugin_type_with_id, "aggregator stopped");
    }
}

pub struct AggregatorWrapperV2 {
    pub meta: PluginMeta,
    description: String,
    aggregator: Mutex<Box<dyn AggregatorV2>>,
    queue: Arc<EventGroupQueue>,
    interval: Duration,
    in_records: Arc<Counter>,
    proc_time_ms: Arc<Counter>,
}

impl AggregatorWrapperV2 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut aggregator: Box<dyn AggregatorV2>,
        interval: Duration,
        flush_queue: mpsc::Sender<GroupEvents>,
    ) -> Result<Self, PluginError> {
        let description = aggregator.description();
        let record = ctx.register_metric_record(ctx.plugin_labels(&meta));
        let queue = Arc::new(EventGroupQueue::new(flush_queue, &record));
        let plugin_queue: Arc<dyn GroupQueue> = queue.clone();
        let override_ms = guard_sync(&description, || aggregator.init(ctx, plugin_queue))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        Ok(Self {
            in_records: record.counter(PROC_IN_RECORDS_TOTAL),
            proc_time_ms: record.counter(PROC_TIME_MS),
            interval: effective_interval(interval, override_ms),
            aggregator: Mutex::new(aggregator),
            description,
            queue,
            meta,
        })
    }

    pub async fn record(&self, group: &GroupEvents) -> Result<(), PluginError> {
        let mut aggregator = self.aggregator.lock().await;
        let started = Instant::now();
        let outcome = guard_sync(&self.description, || aggregator.record(group));
        self.proc_time_ms.add(started.elapsed().as_millis() as i64);
        match outcome {
            Some(Ok(())) => {
                self.in_records.add(group.len() as i64);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_to_queue(&self) {
        let mut aggregator = self.aggregator.lock().await;
        let started = Instant::now();
        let groups = guard_sync(&self.description, || aggregator.get_result()).unwrap_or_default();
        self.proc_time_ms.add(started.elapsed().as_millis() as i64);
        for group in groups {
            if !group.is_empty() {
                self.queue.send(group).await;
            }
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(plugin = %self.meta.plugin_type_with_id, interval = ?self.interval, "aggregator started");
        loop {
            let exit = random_sleep(self.interval, &token).await;
            self.flush_to_queue().await;
            if exit {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;

    /// Hands every record off as its own batch.
    struct PassThrough {
        queue: Option<Arc<dyn LogGroupQueue>>,
    }

    impl AggregatorV1 for PassThrough {
        fn init(
            &mut self,
            _ctx: &PluginContext,
            queue: Arc<dyn LogGroupQueue>,
        ) -> Result<u64, PluginError> {
            self.queue = Some(queue);
            Ok(0)
        }
        fn description(&self) -> String {
            "pass".into()
        }
        fn add(&mut self, record: &Record, _context: &RecordContext) -> Result<(), PluginError> {
            let mut batch = Batch::default();
            batch.logs.push(record.clone());
            match &self.queue {
                Some(queue) => queue.add(batch),
                None => Err(PluginError::Other("not initialized".into())),
            }
        }
        fn flush(&mut self) -> Vec<Batch> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_add_reports_queue_full() {
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::in_memory().unwrap()));
        let (tx, mut rx) = mpsc::channel(1);
        let wrapper = AggregatorWrapperV1::new(
            &ctx,
            PluginMeta::default(),
            Box::new(PassThrough { queue: None }),
            Duration::from_secs(3),
            tx,
        )
        .unwrap();

        let record: Record = [("a", "1")].into_iter().collect();
        wrapper.add(&record, &RecordContext::default()).await.unwrap();
        assert!(matches!(
            wrapper.add(&record, &RecordContext::default()).await,
            Err(PluginError::QueueFull)
        ));

        rx.recv().await.unwrap();
        wrapper.add(&record, &RecordContext::default()).await.unwrap();
        assert_eq!(wrapper.in_records.get(), 2);

        let snapshot = ctx.export_metric_records().pop().unwrap();
        for name in [PROC_IN_RECORDS_TOTAL, PROC_OUT_RECORDS_TOTAL, PROC_TIME_MS] {
            assert!(snapshot.values.contains_key(name), "missing {}", name);
        }
        assert_eq!(snapshot.values[PROC_OUT_RECORDS_TOTAL], 2.0);
    }

    #[tokio::test]
    async fn test_add_with_wait_times_out() {
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::in_memory().unwrap()));
        let record = ctx.register_metric_record(Default::default());
        let (tx, _rx) = mpsc::channel(1);
        let queue = BatchQueue::new(tx, &record);

        queue.add(Batch::default()).unwrap();
        let result = queue
            .add_with_wait(Batch::default(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(PluginError::QueueFull)));
    }
}
