use super::{guard, guard_sync};
use crate::metrics::{
    Counter, FLUSHER_COST_TIME_MS, FLUSHER_DISCARD_RECORDS_TOTAL, FLUSHER_ERROR_TOTAL,
    FLUSHER_IN_RECORDS_SIZE_BYTES, FLUSHER_IN_RECORDS_TOTAL, PROC_IN_RECORDS_TOTAL,
    PROC_OUT_RECORDS_TOTAL, PROC_TIME_MS,
};
use crate::model::{Batch, GroupEvents};
use crate::plugin::{FlusherV1, FlusherV2, PluginContext, PluginError, PluginMeta};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::warn;

struct FlusherMetrics {
    proc_in_records: Arc<Counter>,
    proc_out_records: Arc<Counter>,
    proc_time_ms: Arc<Counter>,
    in_records: Arc<Counter>,
    in_size_bytes: Arc<Counter>,
    discard_records: Arc<Counter>,
    errors: Arc<Counter>,
    cost_time_ms: Arc<Counter>,
}

impl FlusherMetrics {
    fn register(ctx: &PluginContext, meta: &PluginMeta) -> Self {
        let record = ctx.register_metric_record(ctx.plugin_labels(meta));
        Self {
            proc_in_records: record.counter(PROC_IN_RECORDS_TOTAL),
            proc_out_records: record.counter(PROC_OUT_RECORDS_TOTAL),
            proc_time_ms: record.counter(PROC_TIME_MS),
            in_records: record.counter(FLUSHER_IN_RECORDS_TOTAL),
            in_size_bytes: record.counter(FLUSHER_IN_RECORDS_SIZE_BYTES),
            discard_records: record.counter(FLUSHER_DISCARD_RECORDS_TOTAL),
            errors: record.counter(FLUSHER_ERROR_TOTAL),
            cost_time_ms: record.counter(FLUSHER_COST_TIME_MS),
        }
    }

    fn observe(&self, records: usize, bytes: usize, started: Instant, outcome: &Result<(), PluginError>) {
        let elapsed_ms = started.elapsed().as_millis() as i64;
        self.proc_in_records.add(records as i64);
        self.in_records.add(records as i64);
        self.in_size_bytes.add(bytes as i64);
        self.proc_time_ms.add(elapsed_ms);
        self.cost_time_ms.add(elapsed_ms);
        match outcome {
            Ok(()) => self.proc_out_records.add(records as i64),
            Err(_) => {
                self.errors.add(1);
                self.discard_records.add(records as i64);
            }
        }
    }
}

pub struct FlusherWrapperV1 {
    pub meta: PluginMeta,
    description: String,
    context: PluginContext,
    flusher: Mutex<Box<dyn FlusherV1>>,
    metrics: FlusherMetrics,
}

impl FlusherWrapperV1 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut flusher: Box<dyn FlusherV1>,
    ) -> Result<Self, PluginError> {
        let description = flusher.description();
        guard_sync(&description, || flusher.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        Ok(Self {
            metrics: FlusherMetrics::register(ctx, &meta),
            flusher: Mutex::new(flusher),
            context: ctx.clone(),
            description,
            meta,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub async fn is_ready(&self, logstore_key: i64) -> bool {
        let flusher = self.flusher.lock().await;
        let (project, logstore) = (self.context.project(), self.context.logstore());
        guard_sync(&self.description, || flusher.is_ready(project, logstore, logstore_key))
            .unwrap_or(false)
    }

    /// Hand batches to the plugin. Errors are counted and returned; the
    /// batches count as consumed either way.
    pub async fn flush(&self, batches: &[Batch]) -> Result<(), PluginError> {
        let records: usize = batches.iter().map(Batch::len).sum();
        let bytes: usize = batches.iter().map(Batch::size_bytes).sum();
        let started = Instant::now();
        let outcome = {
            let mut flusher = self.flusher.lock().await;
            let ctx = &self.context;
            guard(
                &self.description,
                flusher.flush(ctx.project(), ctx.logstore(), ctx.config_name(), batches),
            )
            .await
            .unwrap_or_else(|| Err(PluginError::Other("flusher panicked".into())))
        };
        self.metrics.observe(records, bytes, started, &outcome);
        outcome
    }

    pub async fn set_urgent(&self, exiting: bool) {
        let mut flusher = self.flusher.lock().await;
        guard_sync(&self.description, || flusher.set_urgent(exiting));
    }

    pub async fn stop(&self) {
        let mut flusher = self.flusher.lock().await;
        match guard(&self.description, flusher.stop()).await {
            Some(Ok(())) | None => {}
            Some(Err(e)) => warn!(
                alarm = "STOP_FLUSHER_ALARM",
                plugin = %self.meta.plugin_type_with_id,
                error = %e,
                "failed to stop flusher"
            ),
        }
    }
}

pub struct FlusherWrapperV2 {
    pub meta: PluginMeta,
    description: String,
    context: PluginContext,
    flusher: Mutex<Box<dyn FlusherV2>>,
    metrics: FlusherMetrics,
}

impl FlusherWrapperV2 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        mut flusher: Box<dyn FlusherV2>,
    ) -> Result<Self, PluginError> {
        let description = flusher.description();
        guard_sync(&description, || flusher.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        Ok(Self {
            metrics: FlusherMetrics::register(ctx, &meta),
            flusher: Mutex::new(flusher),
            context: ctx.clone(),
            description,
            meta,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub async fn is_ready(&self, logstore_key: i64) -> bool {
        let flusher = self.flusher.lock().await;
        let (project, logstore) = (self.context.project(), self.context.logstore());
        guard_sync(&self.description, || flusher.is_ready(project, logstore, logstore_key))
            .unwrap_or(false)
    }

    pub async fn export(&self, groups: &[GroupEvents]) -> Result<(), PluginError> {
        let events: usize = groups.iter().map(GroupEvents::len).sum();
        let bytes: usize = groups.iter().map(GroupEvents::size_bytes).sum();
        let started = Instant::now();
        let outcome = {
            let mut flusher = self.flusher.lock().await;
            guard(&self.description, flusher.export(groups))
                .await
                .unwrap_or_else(|| Err(PluginError::Other("flusher panicked".into())))
        };
        self.metrics.observe(events, bytes, started, &outcome);
        outcome
    }

    pub async fn set_urgent(&self, exiting: bool) {
        let mut flusher = self.flusher.lock().await;
        guard_sync(&self.description, || flusher.set_urgent(exiting));
    }

    pub async fn stop(&self) {
        let mut flusher = self.flusher.lock().await;
        match guard(&self.description, flusher.stop()).await {
            Some(Ok(())) | None => {}
            Some(Err(e)) => warn!(
                alarm = "STOP_FLUSHER_ALARM",
                plugin = %self.meta.plugin_type_with_id,
                error = %e,
                "failed to stop flusher"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use async_trait::async_trait;

    struct Failing;

    #[async_trait]
    impl FlusherV1 for Failing {
        fn init(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
        fn description(&self) -> String {
            "failing".into()
        }
        fn is_ready(&self, _project: &str, _logstore: &str, _key: i64) -> bool {
            true
        }
        async fn flush(
            &mut self,
            _project: &str,
            _logstore: &str,
            _config_name: &str,
            _batches: &[Batch],
        ) -> Result<(), PluginError> {
            Err(PluginError::Other("remote down".into()))
        }
        fn set_urgent(&mut self, _exiting: bool) {}
        async fn stop(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_flush_error_is_counted_as_discard() {
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::in_memory().unwrap()));
        let wrapper = FlusherWrapperV1::new(&ctx, PluginMeta::default(), Box::new(Failing)).unwrap();

        let mut batch = Batch::default();
        batch.logs.push([("content", "x")].into_iter().collect());
        batch.logs.push([("content", "y")].into_iter().collect());

        assert!(wrapper.is_ready(0).await);
        assert!(wrapper.flush(&[batch]).await.is_err());
        assert_eq!(wrapper.metrics.in_records.get(), 2);
        assert_eq!(wrapper.metrics.discard_records.get(), 2);
        assert_eq!(wrapper.metrics.errors.get(), 1);
        assert_eq!(wrapper.metrics.proc_in_records.get(), 2);
        assert_eq!(wrapper.metrics.proc_out_records.get(), 0);
    }

    struct Accepting;

    #[async_trait]
    impl FlusherV1 for Accepting {
        fn init(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
        fn description(&self) -> String {
            "accepting".into()
        }
        fn is_ready(&self, _project: &str, _logstore: &str, _key: i64) -> bool {
            true
        }
        async fn flush(
            &mut self,
            _project: &str,
            _logstore: &str,
            _config_name: &str,
            _batches: &[Batch],
        ) -> Result<(), PluginError> {
            Ok(())
        }
        fn set_urgent(&mut self, _exiting: bool) {}
        async fn stop(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_flush_registers_proc_metrics() {
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::in_memory().unwrap()));
        let wrapper = FlusherWrapperV1::new(&ctx, PluginMeta::default(), Box::new(Accepting)).unwrap();

        let mut batch = Batch::default();
        batch.logs.push([("content", "x")].into_iter().collect());
        wrapper.flush(&[batch.clone(), batch]).await.unwrap();

        assert_eq!(wrapper.metrics.proc_in_records.get(), 2);
        assert_eq!(wrapper.metrics.proc_out_records.get(), 2);
        assert_eq!(wrapper.metrics.discard_records.get(), 0);

        let names: Vec<String> = ctx
            .export_metric_records()
            .into_iter()
            .flat_map(|snapshot| snapshot.values.into_keys())
            .collect();
        for name in [PROC_IN_RECORDS_TOTAL, PROC_OUT_RECORDS_TOTAL, PROC_TIME_MS] {
            assert!(names.iter().any(|n| n == name), "missing {}", name);
        }
    }
}
