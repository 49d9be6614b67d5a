//! The per-pipeline scheduler.
//!
//! A runner owns the input queue, the flush queue, the flush-out store and
//! four stage groups (input, process, aggregate, flush), each driven by its
//! own [`AsyncControl`]. Stages start flush-first and stop input-first;
//! cancelling a stage lets it drain the queue it reads from before returning.

pub mod control;
pub mod flush_out;
pub mod pause;
pub mod tags;
pub mod v1;
pub mod v2;

pub use control::AsyncControl;
pub use flush_out::FlushOutStore;
pub use pause::PauseGate;
pub use tags::BatchTags;
pub use v1::RunnerV1;
pub use v2::RunnerV2;

use crate::config::GlobalConfig;
use crate::metrics::PipelineStatistics;
use crate::model::{Batch, GroupEvents, RecordWithContext};
use crate::plugin::{ContractVersion, PluginContext, PluginError, PluginInstance, PluginMeta};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{info_span, warn, Span};

/// Sleep between `IsReady` polls and between aggregator retries.
pub const READY_POLL: Duration = Duration::from_millis(10);

/// Aggregator `QueueFull` retries between two warnings.
pub const RETRY_WARN_EVERY: u64 = 100;

/// State shared by every stage of one runner.
pub struct RunnerContext {
    pub context: PluginContext,
    pub global: GlobalConfig,
    pub statistics: PipelineStatistics,
    pub tags: BatchTags,
    pub pause: PauseGate,
    pub logstore_key: i64,
    pub max_flush_out_time: Duration,
    pub span: Span,
    flush_out_flag: AtomicBool,
}

impl RunnerContext {
    pub fn new(
        context: PluginContext,
        global: GlobalConfig,
        logstore_key: i64,
        max_flush_out_time: Duration,
    ) -> Self {
        let statistics = PipelineStatistics::new(context.metrics(), context.pipeline_labels());
        let span = info_span!("pipeline", name = %context.config_name());
        Self {
            tags: BatchTags::new(&global.tags),
            pause: PauseGate::new(),
            flush_out_flag: AtomicBool::new(false),
            statistics,
            context,
            global,
            logstore_key,
            max_flush_out_time,
            span,
        }
    }

    /// Set once the pipeline is stopping: the flush stage stops waiting for
    /// unready flushers and parks batches in the flush-out store instead.
    pub fn is_flush_out(&self) -> bool {
        self.flush_out_flag.load(Ordering::SeqCst)
    }

    pub fn set_flush_out(&self, value: bool) {
        self.flush_out_flag.store(value, Ordering::SeqCst);
    }

    /// Number of 10ms readiness polls in the exit-time flush-out drain.
    pub fn flush_out_attempts(&self) -> u64 {
        (self.max_flush_out_time.as_millis() / READY_POLL.as_millis()).max(1) as u64
    }
}

/// Batches left behind by a previous incarnation of a pipeline.
#[derive(Debug)]
pub enum CarryOver {
    Batches(Vec<Batch>),
    Groups(Vec<GroupEvents>),
}

impl Default for CarryOver {
    fn default() -> Self {
        CarryOver::Batches(Vec::new())
    }
}

impl CarryOver {
    pub fn len(&self) -> usize {
        match self {
            CarryOver::Batches(b) => b.len(),
            CarryOver::Groups(g) => g.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_batches(self) -> Vec<Batch> {
        match self {
            CarryOver::Batches(b) => b,
            CarryOver::Groups(g) => g.iter().map(GroupEvents::to_batch).collect(),
        }
    }

    pub fn into_groups(self) -> Vec<GroupEvents> {
        match self {
            CarryOver::Groups(g) => g,
            CarryOver::Batches(b) => {
                let now = SystemTime::now();
                b.into_iter().map(|batch| GroupEvents::from_batch(batch, now)).collect()
            }
        }
    }

    /// Append `other` after the batches already held.
    pub fn append(self, other: CarryOver) -> CarryOver {
        match self {
            CarryOver::Batches(mut b) => {
                b.extend(other.into_batches());
                CarryOver::Batches(b)
            }
            CarryOver::Groups(mut g) => {
                g.extend(other.into_groups());
                CarryOver::Groups(g)
            }
        }
    }
}

/// Per-plugin scheduling options resolved by the pipeline loader.
#[derive(Debug, Clone, Copy)]
pub struct PluginOptions {
    pub interval: Duration,
    pub priority: i32,
}

/// A runner that is still receiving plugins.
pub enum RunnerBuilder {
    V1(RunnerV1),
    V2(RunnerV2),
}

impl RunnerBuilder {
    pub fn new(
        version: ContractVersion,
        ctx: Arc<RunnerContext>,
        input_queue_size: usize,
        flush_queue_size: usize,
        carry_over: CarryOver,
    ) -> Self {
        match version {
            ContractVersion::V1 => RunnerBuilder::V1(RunnerV1::new(
                ctx,
                input_queue_size,
                flush_queue_size,
                carry_over.into_batches(),
            )),
            ContractVersion::V2 => RunnerBuilder::V2(RunnerV2::new(
                ctx,
                input_queue_size,
                flush_queue_size,
                carry_over.into_groups(),
            )),
        }
    }

    pub fn version(&self) -> ContractVersion {
        match self {
            RunnerBuilder::V1(_) => ContractVersion::V1,
            RunnerBuilder::V2(_) => ContractVersion::V2,
        }
    }

    /// Wrap and attach one plugin. The plugin's variant must match the
    /// runner's; extensions are not attached here.
    pub fn add_plugin(
        &mut self,
        meta: PluginMeta,
        instance: PluginInstance,
        options: PluginOptions,
    ) -> Result<(), PluginError> {
        let version = self.version();
        let kind = instance.kind();
        let plugin = meta.plugin_type.clone();
        match (self, instance) {
            (RunnerBuilder::V1(r), PluginInstance::MetricInputV1(p)) => {
                r.add_metric_input(meta, p, options.interval)
            }
            (RunnerBuilder::V1(r), PluginInstance::ServiceInputV1(p)) => r.add_service_input(meta, p),
            (RunnerBuilder::V1(r), PluginInstance::ProcessorV1(p)) => {
                r.add_processor(meta, options.priority, p)
            }
            (RunnerBuilder::V1(r), PluginInstance::AggregatorV1(p)) => {
                r.add_aggregator(meta, p, options.interval)
            }
            (RunnerBuilder::V1(r), PluginInstance::FlusherV1(p)) => r.add_flusher(meta, p),
            (RunnerBuilder::V2(r), PluginInstance::MetricInputV2(p)) => {
                r.add_metric_input(meta, p, options.interval)
            }
            (RunnerBuilder::V2(r), PluginInstance::ServiceInputV2(p)) => r.add_service_input(meta, p),
            (RunnerBuilder::V2(r), PluginInstance::ProcessorV2(p)) => {
                r.add_processor(meta, options.priority, p)
            }
            (RunnerBuilder::V2(r), PluginInstance::AggregatorV2(p)) => {
                r.add_aggregator(meta, p, options.interval)
            }
            (RunnerBuilder::V2(r), PluginInstance::FlusherV2(p)) => r.add_flusher(meta, p),
            _ => Err(PluginError::Unsupported {
                plugin,
                kind,
                version,
            }),
        }
    }

    pub fn aggregator_count(&self) -> usize {
        match self {
            RunnerBuilder::V1(r) => r.aggregator_count(),
            RunnerBuilder::V2(r) => r.aggregator_count(),
        }
    }

    pub fn flusher_count(&self) -> usize {
        match self {
            RunnerBuilder::V1(r) => r.flusher_count(),
            RunnerBuilder::V2(r) => r.flusher_count(),
        }
    }

    /// Undo a partial build: stop what was constructed and hand back the
    /// carry-over so it can be returned to its previous owner.
    pub async fn rollback(self) -> CarryOver {
        match self {
            RunnerBuilder::V1(r) => r.rollback().await,
            RunnerBuilder::V2(r) => r.rollback().await,
        }
    }

    pub fn build(self) -> PluginRunner {
        match self {
            RunnerBuilder::V1(r) => PluginRunner::V1(Arc::new(r)),
            RunnerBuilder::V2(r) => PluginRunner::V2(Arc::new(r)),
        }
    }
}

/// A fully built runner of either contract variant.
#[derive(Clone)]
pub enum PluginRunner {
    V1(Arc<RunnerV1>),
    V2(Arc<RunnerV2>),
}

impl PluginRunner {
    pub fn version(&self) -> ContractVersion {
        match self {
            PluginRunner::V1(_) => ContractVersion::V1,
            PluginRunner::V2(_) => ContractVersion::V2,
        }
    }

    pub fn context(&self) -> &Arc<RunnerContext> {
        match self {
            PluginRunner::V1(r) => r.context(),
            PluginRunner::V2(r) => r.context(),
        }
    }

    pub fn start(&self) {
        match self {
            PluginRunner::V1(r) => r.start(),
            PluginRunner::V2(r) => r.start(),
        }
    }

    pub async fn stop(&self, exit: bool) {
        match self {
            PluginRunner::V1(r) => r.stop(exit).await,
            PluginRunner::V2(r) => r.stop(exit).await,
        }
    }

    /// Park the flush stage. Returns false if it was already cancelled.
    pub async fn pause(&self) -> bool {
        match self {
            PluginRunner::V1(r) => r.pause().await,
            PluginRunner::V2(r) => r.pause().await,
        }
    }

    pub async fn resume(&self) -> bool {
        match self {
            PluginRunner::V1(r) => r.resume().await,
            PluginRunner::V2(r) => r.resume().await,
        }
    }

    /// Enqueue an externally produced record; blocks while the input queue is full.
    pub async fn receive_raw_log(&self, log: RecordWithContext) {
        match self {
            PluginRunner::V1(r) => r.receive_raw_log(log).await,
            PluginRunner::V2(r) => r.receive_raw_log(log).await,
        }
    }

    pub async fn receive_log_group(&self, batch: Batch, pack_id: &str) {
        match self {
            PluginRunner::V1(r) => r.receive_log_group(batch, pack_id).await,
            PluginRunner::V2(r) => r.receive_log_group(batch).await,
        }
    }

    pub fn flush_out_len(&self) -> usize {
        match self {
            PluginRunner::V1(r) => r.flush_out().len(),
            PluginRunner::V2(r) => r.flush_out().len(),
        }
    }

    pub fn take_flush_out(&self) -> CarryOver {
        match self {
            PluginRunner::V1(r) => CarryOver::Batches(r.flush_out().take()),
            PluginRunner::V2(r) => CarryOver::Groups(r.flush_out().take()),
        }
    }

    /// Put carry-over back, converting between variants if needed.
    pub fn merge(&self, carry_over: CarryOver) {
        if carry_over.is_empty() {
            return;
        }
        match self {
            PluginRunner::V1(r) => r.flush_out().add(carry_over.into_batches()),
            PluginRunner::V2(r) => r.flush_out().add(carry_over.into_groups()),
        }
    }
}

/// The received item plus everything queued behind it at this moment.
pub(crate) fn drain<T>(first: T, queue: &mut mpsc::Receiver<T>) -> Vec<T> {
    let pending = queue.len();
    let mut items = Vec::with_capacity(pending + 1);
    items.push(first);
    for _ in 0..pending {
        match queue.try_recv() {
            Ok(item) => items.push(item),
            Err(_) => break,
        }
    }
    items
}

/// Stop every extension of the pipeline, logging failures.
pub(crate) async fn stop_extensions(context: &PluginContext) {
    for (name, extension) in context.extensions() {
        let description = extension.description();
        match crate::wrapper::guard(&description, extension.stop()).await {
            Some(Ok(())) | None => {}
            Some(Err(e)) => warn!(
                alarm = "STOP_EXTENSION_ALARM",
                extension = %name,
                error = %e,
                "failed to stop extension"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogTag;

    #[tokio::test]
    async fn test_drain_takes_only_what_is_queued() {
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..4 {
            tx.send(i).await.unwrap();
        }
        let first = rx.recv().await.unwrap();
        let items = drain(first, &mut rx);
        assert_eq!(items, vec![0, 1, 2, 3]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_carry_over_converts_between_variants() {
        let mut batch = Batch::new("topic-a");
        batch.tags.push(LogTag::new("k", "v"));
        batch.logs.push([("content", "x")].into_iter().collect());

        let groups = CarryOver::Batches(vec![batch]).into_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.topic(), Some("topic-a"));

        let back = CarryOver::Groups(groups).into_batches();
        assert_eq!(back[0].topic, "topic-a");
        assert_eq!(back[0].tag("k"), Some("v"));
        assert_eq!(back[0].logs[0].get("content"), Some("x"));
    }

    #[test]
    fn test_carry_over_append_keeps_order() {
        let a = CarryOver::Batches(vec![Batch::new("a")]);
        let b = CarryOver::Batches(vec![Batch::new("b")]);
        let merged = a.append(b).into_batches();
        let topics: Vec<_> = merged.iter().map(|b| b.topic.as_str()).collect();
        assert_eq!(topics, vec!["a", "b"]);
    }
}
