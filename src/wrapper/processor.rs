use super::guard_sync;
use crate::metrics::{Counter, PROC_IN_RECORDS_TOTAL, PROC_OUT_RECORDS_TOTAL, PROC_TIME_MS};
use crate::model::{GroupEvents, Record};
use crate::plugin::{PluginContext, PluginError, PluginMeta, ProcessorV1, ProcessorV2};
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct ProcessorMetrics {
    in_records: Arc<Counter>,
    out_records: Arc<Counter>,
    proc_time_ms: Arc<Counter>,
}

impl ProcessorMetrics {
    fn register(ctx: &PluginContext, meta: &PluginMeta) -> Self {
        let record = ctx.register_metric_record(ctx.plugin_labels(meta));
        Self {
            in_records: record.counter(PROC_IN_RECORDS_TOTAL),
            out_records: record.counter(PROC_OUT_RECORDS_TOTAL),
            proc_time_ms: record.counter(PROC_TIME_MS),
        }
    }
}

pub struct ProcessorWrapperV1 {
    pub meta: PluginMeta,
    pub priority: i32,
    description: String,
    processor: Mutex<Box<dyn ProcessorV1>>,
    metrics: ProcessorMetrics,
}

impl ProcessorWrapperV1 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        priority: i32,
        mut processor: Box<dyn ProcessorV1>,
    ) -> Result<Self, PluginError> {
        let description = processor.description();
        guard_sync(&description, || processor.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        Ok(Self {
            metrics: ProcessorMetrics::register(ctx, &meta),
            processor: Mutex::new(processor),
            description,
            priority,
            meta,
        })
    }

    /// Run the processor. A panic drops the records it was given.
    pub fn process(&self, logs: Vec<Record>) -> Vec<Record> {
        self.metrics.in_records.add(logs.len() as i64);
        let started = Instant::now();
        let out = {
            let mut processor = match self.processor.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard_sync(&self.description, || processor.process_logs(logs)).unwrap_or_default()
        };
        self.metrics
            .proc_time_ms
            .add(started.elapsed().as_millis() as i64);
        self.metrics.out_records.add(out.len() as i64);
        out
    }
}

pub struct ProcessorWrapperV2 {
    pub meta: PluginMeta,
    pub priority: i32,
    description: String,
    processor: Mutex<Box<dyn ProcessorV2>>,
    metrics: ProcessorMetrics,
}

impl ProcessorWrapperV2 {
    pub fn new(
        ctx: &PluginContext,
        meta: PluginMeta,
        priority: i32,
        mut processor: Box<dyn ProcessorV2>,
    ) -> Result<Self, PluginError> {
        let description = processor.description();
        guard_sync(&description, || processor.init(ctx))
            .unwrap_or_else(|| Err(PluginError::init_failed(&meta.plugin_type, "panic in init")))?;
        Ok(Self {
            metrics: ProcessorMetrics::register(ctx, &meta),
            processor: Mutex::new(processor),
            description,
            priority,
            meta,
        })
    }

    pub fn process(&self, input: GroupEvents) -> Vec<GroupEvents> {
        self.metrics.in_records.add(input.len() as i64);
        let started = Instant::now();
        let mut output = Vec::new();
        {
            let mut processor = match self.processor.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard_sync(&self.description, || processor.process(input, &mut output)).is_none() {
                output.clear();
            }
        }
        self.metrics
            .proc_time_ms
            .add(started.elapsed().as_millis() as i64);
        let events: usize = output.iter().map(GroupEvents::len).sum();
        self.metrics.out_records.add(events as i64);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;

    struct Exploding;

    impl ProcessorV1 for Exploding {
        fn init(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
        fn description(&self) -> String {
            "exploding".into()
        }
        fn process_logs(&mut self, logs: Vec<Record>) -> Vec<Record> {
            if logs.len() > 1 {
                panic!("too many");
            }
            logs
        }
    }

    #[test]
    fn test_panic_drops_batch_and_processor_survives() {
        let ctx = PluginContext::new("p", "l", "c", Arc::new(CheckpointStore::in_memory().unwrap()));
        let wrapper =
            ProcessorWrapperV1::new(&ctx, PluginMeta::default(), 0, Box::new(Exploding)).unwrap();

        let out = wrapper.process(vec![Record::new(), Record::new()]);
        assert!(out.is_empty());

        let out = wrapper.process(vec![[("a", "b")].into_iter().collect()]);
        assert_eq!(out.len(), 1);
        assert_eq!(wrapper.metrics.in_records.get(), 3);
        assert_eq!(wrapper.metrics.out_records.get(), 1);
    }
}
