//! One configured dataflow: the plugin graph materialised into a runner,
//! plus its identity (name, detail hash) and lifecycle state.

pub mod builder;
pub mod document;
pub mod ingest;
pub mod topic;

pub use builder::{BuildFailure, PipelineFactory, DEFAULT_AGGREGATOR};
pub use document::{MixProcessMode, PipelineConfig, PipelineDocument, PluginEntry};
pub use ingest::{parse_tags, DEFAULT_TAG_PREFIX, LOG_TOPIC_KEY};
pub use topic::TopicFormat;

use crate::config::GlobalConfig;
use crate::metrics::MetricSnapshot;
use crate::plugin::{ContractVersion, PluginContext, PluginError};
use crate::runner::{CarryOver, PluginRunner};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    ConfigInvalid(String),

    #[error("plugin error: {0}")]
    PluginInitFailed(#[from] PluginError),

    #[error("failed to create config because timeout stop has happened on it: {0}")]
    NameBlockedByTimeoutStop(String),

    #[error("undefined config version {0}")]
    VersionMismatch(String),

    #[error("invalid pipeline document: {0}")]
    Json(#[from] serde_json::Error),
}

/// A live pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    global: GlobalConfig,
    instance_id: Uuid,
    runner: PluginRunner,
    already_started: AtomicBool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.config.name)
            .field("detail_hash", &self.config.detail_hash)
            .field("instance_id", &self.instance_id)
            .field("version", &self.runner.version())
            .finish()
    }
}

impl Pipeline {
    pub(crate) fn new(config: PipelineConfig, global: GlobalConfig, runner: PluginRunner) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            already_started: AtomicBool::new(false),
            config,
            global,
            runner,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn project(&self) -> &str {
        &self.config.project
    }

    pub fn logstore(&self) -> &str {
        &self.config.logstore
    }

    pub fn detail_hash(&self) -> &str {
        &self.config.detail_hash
    }

    /// Unique per constructed instance; a pipeline reclaimed from the
    /// always-online cache keeps its id.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn version(&self) -> ContractVersion {
        self.runner.version()
    }

    pub fn context(&self) -> &PluginContext {
        &self.runner.context().context
    }

    pub fn runner(&self) -> &PluginRunner {
        &self.runner
    }

    pub fn is_always_online(&self) -> bool {
        self.global.always_online
    }

    pub fn already_started(&self) -> bool {
        self.already_started.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_already_started(&self) {
        self.already_started.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.runner.context().pause.is_paused()
    }

    /// Start the stages flush-first.
    pub fn start(&self) {
        let span = &self.runner.context().span;
        info!(parent: span, hash = %self.config.detail_hash, version = %self.version(), "config start");
        self.runner.context().set_flush_out(false);
        self.runner.start();
        self.already_started.store(true, Ordering::SeqCst);
        info!(parent: span, "config start success");
    }

    /// Resume a pipeline whose stages are already running, start it otherwise.
    pub async fn activate(&self) {
        if self.already_started() {
            info!(parent: &self.runner.context().span, "config resume");
            self.runner.resume().await;
        } else {
            self.start();
        }
    }

    /// Park the flush stage. Records keep flowing into the queues until
    /// they fill up.
    pub async fn pause(&self) -> bool {
        info!(parent: &self.runner.context().span, "config pause");
        self.runner.pause().await
    }

    pub async fn resume(&self) -> bool {
        self.runner.resume().await
    }

    /// Stop every stage; `exit` marks a process shutdown, which makes
    /// flushers urgent and triggers the flush-out drain.
    pub async fn stop(&self, exit: bool) {
        let span = &self.runner.context().span;
        info!(parent: span, exit, "config stop");
        if self.is_paused() {
            self.runner.resume().await;
        }
        self.runner.stop(exit).await;
        info!(parent: span, flush_out = self.runner.flush_out_len(), "config stop success");
    }

    pub fn flush_out_len(&self) -> usize {
        self.runner.flush_out_len()
    }

    pub fn take_flush_out(&self) -> CarryOver {
        self.runner.take_flush_out()
    }

    pub fn merge_flush_out(&self, carry_over: CarryOver) {
        self.runner.merge(carry_over);
    }

    pub fn export_metric_records(&self) -> Vec<MetricSnapshot> {
        self.context().export_metric_records()
    }
}
