use super::timer::random_sleep;
use super::{guard, guard_sync};
use crate::metrics::{Counter, Latency, MetricRecord, PROC_OUT_RECORDS_TOTAL, PROC_TIME_MS};
use crate::model::{GroupEvents, Record, RecordContext, RecordWithContext};
use crate::plugin::{
    Collector, GroupCollector, MetricInputV1, MetricInputV2, PluginContext, PluginError,
    PluginMeta, ServiceInputV1, ServiceInputV2,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collector handed to v1 inputs; writes into the input queue.
pub struct InputCollector {
    queue: mpsc::Sender<RecordWithContext>,
    out_records: Arc<Counter>,
}

impl InputCollector {
    pub fn new(queue: mpsc::Sender<RecordWithContext>, record: &MetricRecord) -> Self {
        Self {
            queue,
            out_records: record.counter(PROC_OUT_RECORDS_TOTAL),
        }
    }
}

#[async_trait]
impl Collector for InputCollector {
    async fn add_record(&self, record: Record, context: RecordContext) {
        if self
            .queue
            .send(RecordWithContext::new(record, context))
            .await
            .is_ok()
        {
            self.out_records.add(1);
        } else {
            debug!("input queue closed, record dropped");
        }
    }

    fn try_add_record(&self, record: Record, context: RecordContext) -> Result<(), PluginError> {
        match self.queue.try_send(RecordWithContext::new(record, context)) {
            Ok(()) => {
                self.out_records.add(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PluginError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PluginError::Other("input queue closed".to_string()))
            }
        }
    }
}

/// Collector handed to v2 inputs.
pub struct GroupInputCollector {
    queue: mpsc::Sender<GroupEvents>,
    out_records: Arc<Counter>,
}

impl GroupInputCollector {
    pub fn new(queue: mpsc::Sender<GroupEvents>, record: &MetricRecord) -> Self {
        Self {
            queue,
            out_records: record.counter(PROC_OUT_RECORDS_TOTAL),
        }
    }
}

#[async_trait]
impl GroupCollector for GroupInputCollector {
    async fn collect(&self, group: GroupEvents) {
        let events = group.len() as i64;
        if self.queue.send(group).await.is_ok() {
            self.out_records.add(events);
        } else {
            debug!("input queue closed, group dropped");
        }
    }

    fn try_collect(&self, group: GroupEvents) -> Result<(), PluginError> {
        let events = group.len() as i64;
        match self.queue.try_send(group) {
            Ok(()) => {
                self.out_records.add(events);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PluginError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PluginError::Other("input queue closed".to_string()))
            }
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

pub struct MetricWrapperV1 {
    pub meta: PluginMeta,
    description: String,
    input: Mutex<Box<dyn MetricInputV1>>,
    interval: Duration,
    collector: InputCollector,
    collect_latency: Arc<Latency>,
    proc_time_ms: Arc<Counter>,
    record: Arc<MetricRecord>,
}

impl MetricWrapperV1 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut input: Box<dyn MetricInputV1>,
        interval: Duration,
        queue: mpsc::Sender<RecordWithContext>,
        collect_latency: Arc<Latency>,
    ) -> Result<Self, PluginError> {
        let description = input.description();
        let override_ms = guard_sync(&description, || input.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        let record = ctx.register_metric_record(ctx.plugin_labels(&meta));
        Ok(Self {
            collector: InputCollector::new(queue, &record),
            proc_time_ms: record.counter(PROC_TIME_MS),
            interval: effective_interval(interval, override_ms),
            input: Mutex::new(input),
            collect_latency,
            description,
            record,
            meta,
        })
    }

    pub fn record(&self) -> &Arc<MetricRecord> {
        &self.record
    }

    /// Collect every interval until `token` fires, then collect once more.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mode = self.input.lock().await.mode();
        info!(plugin = %self.meta.plugin_type_with_id, interval = ?self.interval, ?mode, "metric input started");
        loop {
            let exit = random_sleep(self.interval, &token).await;
            let started = Instant::now();
            {
                let mut input = self.input.lock().await;
                if let Some(Err(e)) = guard(&self.description, input.collect(&self.collector)).await {
                    warn!(alarm = "INPUT_COLLECT_ALARM", plugin = %self.meta.plugin_type_with_id, error = %e, "metric collect failed");
                }
            }
            let elapsed = started.elapsed();
            self.collect_latency.observe(elapsed);
            self.proc_time_ms.add(elapsed.as_millis() as i64);
            if exit {
                break;
            }
        }
        debug!(plugin = %self.meta.plugin_type_with_id, "metric input stopped");
    }
}

pub struct MetricWrapperV2 {
    pub meta: PluginMeta,
    description: String,
    input: Mutex<Box<dyn MetricInputV2>>,
    interval: Duration,
    collector: GroupInputCollector,
    collect_latency: Arc<Latency>,
    proc_time_ms: Arc<Counter>,
}

impl MetricWrapperV2 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut input: Box<dyn MetricInputV2>,
        interval: Duration,
        queue: mpsc::Sender<GroupEvents>,
        collect_latency: Arc<Latency>,
    ) -> Result<Self, PluginError> {
        let description = input.description();
        let override_ms = guard_sync(&description, || input.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        let record = ctx.register_metric_record(ctx.plugin_labels(&meta));
        Ok(Self {
            collector: GroupInputCollector::new(queue, &record),
            proc_time_ms: record.counter(PROC_TIME_MS),
            interval: effective_interval(interval, override_ms),
            input: Mutex::new(input),
            collect_latency,
            description,
            meta,
        })
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(plugin = %self.meta.plugin_type_with_id, interval = ?self.interval, "metric input started");
        loop {
            let exit = random_sleep(self.interval, &token).await;
            let started = Instant::now();
            {
                let mut input = self.input.lock().await;
                if let Some(Err(e)) = guard(&self.description, input.read(&self.collector)).await {
                    warn!(alarm = "INPUT_COLLECT_ALARM", plugin = %self.meta.plugin_type_with_id, error = %e, "metric read failed");
                }
            }
            let elapsed = started.elapsed();
            self.collect_latency.observe(elapsed);
            self.proc_time_ms.add(elapsed.as_millis() as i64);
            if exit {
                break;
            }
        }
    }
}

pub struct ServiceWrapperV1 {
    pub meta: PluginMeta,
    description: String,
    input: Arc<dyn ServiceInputV1>,
    collector: Arc<InputCollector>,
}

impl ServiceWrapperV1 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut input: Box<dyn ServiceInputV1>,
        queue: mpsc::Sender<RecordWithContext>,
    ) -> Result<Self, PluginError> {
        let description = input.description();
        guard_sync(&description, || input.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        let record = ctx.register_metric_record(ctx.plugin_labels(&meta));
        Ok(Self {
            collector: Arc::new(InputCollector::new(queue, &record)),
            input: Arc::from(input),
            description,
            meta,
        })
    }

    /// Runs the service until it returns on its own or after `stop`.
    pub async fn run(self: Arc<Self>) {
        info!(plugin = %self.meta.plugin_type_with_id, "service input started");
        let collector: Arc<dyn Collector> = self.collector.clone();
        if let Some(Err(e)) = guard(&self.description, self.input.start(collector)).await {
            warn!(alarm = "SERVICE_INPUT_ALARM", plugin = %self.meta.plugin_type_with_id, error = %e, "service input exited with error");
        }
        debug!(plugin = %self.meta.plugin_type_with_id, "service input returned");
    }

    pub async fn stop(&self) {
        if let Some(Err(e)) = guard(&self.description, self.input.stop()).await {
            warn!(alarm = "STOP_SERVICE_ALARM", plugin = %self.meta.plugin_type_with_id, error = %e, "failed to stop service input");
        }
    }
}

pub struct ServiceWrapperV2 {
    pub meta: PluginMeta,
    description: String,
    input: Arc<dyn ServiceInputV2>,
    collector: Arc<GroupInputCollector>,
}

impl ServiceWrapperV2 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut input: Box<dyn ServiceInputV2>,
        queue: mpsc::Sender<GroupEvents>,
    ) -> Result<Self, PluginError> {
        let description = input.description();
        guard_sync(&description, || input.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        let record = ctx.register_metric_record(ctx.plugin_labels(&meta));
        Ok(Self {
            collector: Arc::new(GroupInputCollector::new(queue, &record)),
            input: Arc::from(input),
            description,
            meta,
        })
    }

    pub async fn run(self: Arc<Self>) {
        info!(plugin = %self.meta.plugin_type_with_id, "service input started");
        let collector: Arc<dyn GroupCollector> = self.collector.clone();
        if let Some(Err(e)) = guard(&self.description, self.input.start_service(collector)).await {
            warn!(alarm = "SERVICE_INPUT_ALARM", plugin = %self.meta.plugin_type_with_id, error = %e, "service input exited with error");
        }
    }

    pub async fn stop(&self) {
        if let Some(Err(e)) = guard(&self.description, self.input.stop()).await {
            warn!(alarm = "STOP_SERVICE_ALARM", plugin = %self.meta.plugin_type_with_id, error = %e, "failed to stop service input");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MetricInputV1 for Ticker {
        fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
            Ok(10)
        }
        fn description(&self) -> String {
            "ticker".into()
        }
        async fn collect(&mut self, collector: &dyn Collector) -> Result<(), PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            collector
                .add_record([("n", "1")].into_iter().collect(), RecordContext::default())
                .await;
            Ok(())
        }
    }

    fn context() -> PluginContext {
        PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_try_add_reports_queue_full() {
        let ctx = context();
        let record = ctx.register_metric_record(Default::default());
        let (tx, _rx) = mpsc::channel(1);
        let collector = InputCollector::new(tx, &record);

        collector
            .try_add_record(Record::new(), RecordContext::default())
            .unwrap();
        assert!(matches!(
            collector.try_add_record(Record::new(), RecordContext::default()),
            Err(PluginError::QueueFull)
        ));
        assert_eq!(record.counter(PROC_OUT_RECORDS_TOTAL).get(), 1);
    }

    #[tokio::test]
    async fn test_metric_wrapper_uses_interval_override() {
        let ctx = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(100);
        let meta = PluginMeta {
            plugin_type_with_id: "metric_ticker/1".into(),
            plugin_type: "metric_ticker".into(),
            plugin_id: "1".into(),
            ..PluginMeta::default()
        };
        let wrapper = Arc::new(
            MetricWrapperV1::new(
                &ctx,
                meta,
                Box::new(Ticker { calls: calls.clone() }),
                Duration::from_secs(3600),
                tx,
                Arc::new(Latency::default()),
            )
            .unwrap(),
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(wrapper.clone().run(token.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        task.await.unwrap();

        let collected = calls.load(Ordering::SeqCst);
        assert!(collected >= 3, "collected {} times", collected);
        assert!(rx.try_recv().is_ok());
        assert_eq!(ctx.export_metric_records().len(), 1);
    }
}
