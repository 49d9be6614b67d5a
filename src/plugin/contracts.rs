use super::context::PluginContext;
use super::PluginError;
use crate::model::{Batch, GroupEvents, Record, RecordContext};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// How a metric input produces data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    Push,
    #[default]
    Pull,
}

/// Sink a v1 input writes records into (the pipeline's input queue).
#[async_trait]
pub trait Collector: Send + Sync {
    /// Enqueue a record, suspending until the input queue has capacity.
    async fn add_record(&self, record: Record, context: RecordContext);

    /// Enqueue without waiting. Fails with [`PluginError::QueueFull`] when the
    /// input queue is saturated; inputs that must not block use this and drop.
    fn try_add_record(&self, record: Record, context: RecordContext) -> Result<(), PluginError>;
}

/// Sink a v2 input writes event groups into.
#[async_trait]
pub trait GroupCollector: Send + Sync {
    async fn collect(&self, group: GroupEvents);

    fn try_collect(&self, group: GroupEvents) -> Result<(), PluginError>;
}

/// The flush queue as seen by a v1 aggregator.
#[async_trait]
pub trait LogGroupQueue: Send + Sync {
    /// Non-blocking enqueue; `QueueFull` on saturation.
    fn add(&self, batch: Batch) -> Result<(), PluginError>;

    /// Enqueue, waiting at most `wait` for capacity.
    async fn add_with_wait(&self, batch: Batch, wait: Duration) -> Result<(), PluginError>;
}

/// The flush queue as seen by a v2 aggregator.
#[async_trait]
pub trait GroupQueue: Send + Sync {
    fn add(&self, group: GroupEvents) -> Result<(), PluginError>;

    async fn add_with_wait(&self, group: GroupEvents, wait: Duration) -> Result<(), PluginError>;
}

/// Pull input, collected every interval.
#[async_trait]
pub trait MetricInputV1: Send + Sync {
    /// Returns an interval override in milliseconds; 0 keeps the configured one.
    fn init(&mut self, ctx: &PluginContext) -> Result<u64, PluginError>;

    fn description(&self) -> String;

    fn mode(&self) -> InputMode {
        InputMode::Pull
    }

    async fn collect(&mut self, collector: &dyn Collector) -> Result<(), PluginError>;
}

#[async_trait]
pub trait MetricInputV2: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<u64, PluginError>;

    fn description(&self) -> String;

    async fn read(&mut self, ctx: &dyn GroupCollector) -> Result<(), PluginError>;
}

/// Push input running for the lifetime of the pipeline.
#[async_trait]
pub trait ServiceInputV1: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<u64, PluginError>;

    fn description(&self) -> String;

    /// Runs until [`ServiceInputV1::stop`] is called.
    async fn start(&self, collector: Arc<dyn Collector>) -> Result<(), PluginError>;

    /// Cooperative and idempotent; may be called while `start` is running.
    async fn stop(&self) -> Result<(), PluginError>;
}

#[async_trait]
pub trait ServiceInputV2: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<u64, PluginError>;

    fn description(&self) -> String;

    async fn start_service(&self, ctx: Arc<dyn GroupCollector>) -> Result<(), PluginError>;

    async fn stop(&self) -> Result<(), PluginError>;
}

/// Synchronous record transformation. Returning an empty vector drops the
/// records and short-circuits the rest of the chain.
pub trait ProcessorV1: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;

    fn description(&self) -> String;

    fn process_logs(&mut self, logs: Vec<Record>) -> Vec<Record>;
}

pub trait ProcessorV2: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;

    fn description(&self) -> String;

    /// Transform `input`, pushing the resulting groups into `output`.
    fn process(&mut self, input: GroupEvents, output: &mut Vec<GroupEvents>);
}

/// Stateful record-to-batch aggregation.
pub trait AggregatorV1: Send + Sync {
    /// `queue` is the flush queue; the aggregator hands off full batches
    /// through it. Returns an interval override in milliseconds.
    fn init(&mut self, ctx: &PluginContext, queue: Arc<dyn LogGroupQueue>)
        -> Result<u64, PluginError>;

    fn description(&self) -> String;

    /// Fails with `QueueFull` without consuming the record when a full batch
    /// cannot be handed off; the caller retries with the same record.
    fn add(&mut self, record: &Record, context: &RecordContext) -> Result<(), PluginError>;

    /// Called on every timer tick and once more at shutdown.
    fn flush(&mut self) -> Vec<Batch>;

    fn reset(&mut self) {}
}

pub trait AggregatorV2: Send + Sync {
    fn init(&mut self, ctx: &PluginContext, queue: Arc<dyn GroupQueue>) -> Result<u64, PluginError>;

    fn description(&self) -> String;

    fn record(&mut self, group: &GroupEvents) -> Result<(), PluginError>;

    fn get_result(&mut self) -> Vec<GroupEvents>;
}

/// Sink for batches.
#[async_trait]
pub trait FlusherV1: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;

    fn description(&self) -> String;

    fn is_ready(&self, project: &str, logstore: &str, logstore_key: i64) -> bool;

    /// An error means the batches are consumed anyway; retries are the
    /// flusher's own business.
    async fn flush(
        &mut self,
        project: &str,
        logstore: &str,
        config_name: &str,
        batches: &[Batch],
    ) -> Result<(), PluginError>;

    fn set_urgent(&mut self, exiting: bool);

    async fn stop(&mut self) -> Result<(), PluginError>;
}

#[async_trait]
pub trait FlusherV2: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;

    fn description(&self) -> String;

    fn is_ready(&self, project: &str, logstore: &str, logstore_key: i64) -> bool;

    async fn export(&mut self, groups: &[GroupEvents]) -> Result<(), PluginError>;

    fn set_urgent(&mut self, exiting: bool);

    async fn stop(&mut self) -> Result<(), PluginError>;
}

/// Shared capability resolved by `name/id` within one pipeline.
#[async_trait]
pub trait Extension: Send + Sync {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError>;

    fn description(&self) -> String;

    async fn stop(&self) -> Result<(), PluginError>;

    /// Lets consumers downcast to the concrete capability.
    fn as_any(&self) -> &dyn Any;
}
