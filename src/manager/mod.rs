//! Process-wide registry of pipelines.
//!
//! A configuration change is applied as `hold_on(false)`, one `load_pipeline`
//! per document, then `resume()`. Between those calls the previous
//! incarnations sit in the "last" table so new pipelines can inherit their
//! unflushed batches. Pipelines that do not stop within the stop timeout are
//! parked in the disabled table, which blocks their name until the stop
//! finishes.

pub mod always_online;

pub use always_online::AlwaysOnlineManager;

use crate::checkpoint::{CheckpointStore, CheckpointSweeper, RetentionPolicy};
use crate::config::{AgentConfig, CheckpointSettings, GlobalConfig, RuntimeSettings};
use crate::metrics::MetricSnapshot;
use crate::pipeline::{BuildFailure, Pipeline, PipelineConfig, PipelineError, PipelineFactory};
use crate::plugin::PluginRegistry;
use crate::plugins::self_statistics::{self, MetricsSource, SELF_STATISTICS_INPUT};
use crate::runner::CarryOver;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Name of the built-in statistics pipeline.
pub const SELF_STATISTICS_PIPELINE: &str = "__self_statistics__";

/// Collection interval of the built-in statistics pipeline.
const SELF_STATISTICS_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("failed to read pipeline directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type PipelineMap = HashMap<String, Arc<Pipeline>>;

fn lock(map: &Mutex<PipelineMap>) -> MutexGuard<'_, PipelineMap> {
    match map.lock() {
        Ok(m) => m,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tables shared with the checkpoint sweeper and the statistics input.
#[derive(Default)]
struct Tables {
    live: RwLock<PipelineMap>,
    disabled: Mutex<PipelineMap>,
}

#[async_trait]
impl RetentionPolicy for Tables {
    async fn retained_pipelines(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self.live.read().await.keys().cloned().collect();
        names.extend(lock(&self.disabled).keys().cloned());
        // Kept outside the live table but owns checkpoints like any config.
        names.insert(SELF_STATISTICS_PIPELINE.to_string());
        names
    }
}

#[async_trait]
impl MetricsSource for Tables {
    async fn export_all(&self) -> Vec<MetricSnapshot> {
        self.live
            .read()
            .await
            .values()
            .flat_map(|p| p.export_metric_records())
            .collect()
    }
}

pub struct PipelineManager {
    factory: PipelineFactory,
    tables: Arc<Tables>,
    last: Mutex<PipelineMap>,
    always_online: AlwaysOnlineManager,
    sweeper: CheckpointSweeper,
    statistics: tokio::sync::Mutex<Option<Arc<Pipeline>>>,
}

impl PipelineManager {
    pub fn new(
        mut registry: PluginRegistry,
        checkpoint: Arc<CheckpointStore>,
        defaults: GlobalConfig,
        runtime: RuntimeSettings,
        checkpoint_settings: &CheckpointSettings,
    ) -> Self {
        let tables = Arc::new(Tables::default());
        self_statistics::register(&mut registry, tables.clone());
        let sweeper = CheckpointSweeper::new(
            checkpoint.clone(),
            tables.clone(),
            checkpoint_settings.clean_interval,
            checkpoint_settings.max_clean_items,
        );
        Self {
            factory: PipelineFactory::new(registry, checkpoint, defaults, runtime),
            tables,
            last: Mutex::new(HashMap::new()),
            always_online: AlwaysOnlineManager::new(),
            sweeper,
            statistics: tokio::sync::Mutex::new(None),
        }
    }

    pub fn from_config(
        registry: PluginRegistry,
        checkpoint: Arc<CheckpointStore>,
        config: &AgentConfig,
    ) -> Self {
        Self::new(
            registry,
            checkpoint,
            config.global.clone(),
            config.runtime.clone(),
            &config.checkpoint,
        )
    }

    pub fn factory(&self) -> &PipelineFactory {
        &self.factory
    }

    fn stop_timeout(&self) -> Duration {
        self.factory.runtime().stop_timeout
    }

    fn stop_deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.stop_timeout()
    }

    /// Load a document under `name` with the name doubling as logstore.
    pub async fn load(&self, name: &str, text: &str) -> Result<(), ManagerError> {
        self.load_pipeline("", name, name, text).await
    }

    /// Build a pipeline from `text` and put it into the live table.
    ///
    /// An empty `text` removes `name` from the live table. The new pipeline
    /// is not started; [`PipelineManager::resume`] does that.
    pub async fn load_pipeline(
        &self,
        project: &str,
        logstore: &str,
        name: &str,
        text: &str,
    ) -> Result<(), ManagerError> {
        if text.is_empty() {
            info!(pipeline = %name, logstore = %logstore, "delete config");
            self.tables.live.write().await.remove(name);
            return Ok(());
        }
        info!(pipeline = %name, logstore = %logstore, "load config");
        let config = PipelineConfig::parse(project, logstore, name, text)?;

        {
            let mut disabled = lock(&self.tables.disabled);
            if let Some(blocked) = disabled.get(name) {
                if blocked.detail_hash() == config.detail_hash {
                    return Err(PipelineError::NameBlockedByTimeoutStop(name.to_string()).into());
                }
                disabled.remove(name);
                info!(pipeline = %name, "retry timeout config because config detail has changed");
            }
        }

        // The pipeline the carry-over came from, so a failed build can give it back.
        let mut source: Option<Arc<Pipeline>> = None;
        let mut carry_over = CarryOver::default();
        if let Some(cached) = self.always_online.take(name) {
            info!(
                pipeline = %name,
                same = cached.detail_hash() == config.detail_hash,
                "found always-online config"
            );
            if cached.detail_hash() == config.detail_hash {
                cached.mark_already_started();
                info!(pipeline = %name, flush_out = cached.flush_out_len(), "config is same after reload, use it again");
                self.tables.live.write().await.insert(name.to_string(), cached);
                return Ok(());
            }
            cached.stop(false).await;
            carry_over = cached.take_flush_out();
            info!(pipeline = %name, "config is changed after reload, stop and create a new one");
            source = Some(cached);
        } else if let Some(previous) = lock(&self.last).get(name).cloned() {
            carry_over = previous.take_flush_out();
            source = Some(previous);
        }

        match self.factory.build(config, carry_over).await {
            Ok(pipeline) => {
                self.tables
                    .live
                    .write()
                    .await
                    .insert(name.to_string(), Arc::new(pipeline));
                Ok(())
            }
            Err(BuildFailure { error, carry_over }) => {
                if let Some(source) = source {
                    source.merge_flush_out(carry_over);
                    lock(&self.last).insert(name.to_string(), source);
                } else if !carry_over.is_empty() {
                    warn!(pipeline = %name, batches = carry_over.len(), "carry-over dropped after failed load");
                }
                Err(error.into())
            }
        }
    }

    /// Stop every live pipeline and move it to the last table.
    ///
    /// Always-online pipelines are paused and cached instead of stopped
    /// unless the process is exiting. A pipeline that does not stop within
    /// the stop timeout is moved to the disabled table.
    pub async fn hold_on(&self, exit: bool) {
        info!(exit, "hold on begin");
        self.sweeper.stop().await;
        if let Some(statistics) = self.statistics.lock().await.take() {
            statistics.stop(exit).await;
        }

        let live: Vec<(String, Arc<Pipeline>)> = self.tables.live.write().await.drain().collect();
        for (name, pipeline) in &live {
            // Pause and the fallback stop share one stop timeout.
            let deadline = self.stop_deadline();
            if pipeline.is_always_online() && !exit {
                let paused = tokio::time::timeout_at(deadline, pipeline.pause()).await;
                if matches!(paused, Ok(true)) {
                    self.always_online
                        .add(pipeline.clone(), pipeline.global().delay_stop());
                    continue;
                }
                warn!(pipeline = %name, "pause timed out, stopping always-online config");
            }
            self.stop_with_timeout(pipeline.clone(), exit, deadline).await;
        }

        *lock(&self.last) = live.into_iter().collect();
        if exit {
            self.always_online.shutdown().await;
            for cached in self.always_online.take_all() {
                self.stop_with_timeout(cached, true, self.stop_deadline()).await;
            }
        }
        info!("hold on done");
    }

    /// Stop `pipeline`, giving up at `deadline`. A timed-out pipeline is
    /// disabled until its stop completes in the background.
    async fn stop_with_timeout(
        &self,
        pipeline: Arc<Pipeline>,
        exit: bool,
        deadline: tokio::time::Instant,
    ) -> bool {
        let mut stopping = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.stop(exit).await }
        });
        match tokio::time::timeout_at(deadline, &mut stopping).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(alarm = "CONFIG_STOP_ALARM", pipeline = %pipeline.name(), error = %e, "stop config failed");
                false
            }
            Err(_) => {
                let name = pipeline.name().to_string();
                error!(
                    alarm = "CONFIG_STOP_TIMEOUT_ALARM",
                    pipeline = %name,
                    timeout = ?self.stop_timeout(),
                    "timeout when stop config, disabling it"
                );
                lock(&self.tables.disabled).insert(name.clone(), pipeline.clone());
                let tables = self.tables.clone();
                tokio::spawn(async move {
                    let _ = stopping.await;
                    let mut disabled = lock(&tables.disabled);
                    if disabled
                        .get(&name)
                        .is_some_and(|current| Arc::ptr_eq(current, &pipeline))
                    {
                        disabled.remove(&name);
                    }
                    info!(pipeline = %name, "timeout-stopped config finally stopped");
                });
                false
            }
        }
    }

    /// Start or resume every live pipeline and restart background tasks.
    pub async fn resume(&self) {
        info!("resume begin");
        if self.factory.runtime().self_statistics {
            self.start_statistics().await;
        }

        let existing: HashSet<String> = {
            let live = self.tables.live.read().await;
            for pipeline in live.values() {
                pipeline.activate().await;
            }
            live.keys().cloned().collect()
        };

        for orphan in self.always_online.take_deleted(&existing) {
            info!(pipeline = %orphan.name(), "stop deleted always-online config");
            tokio::spawn(async move { orphan.stop(false).await });
        }
        lock(&self.last).clear();
        self.always_online.start();
        self.sweeper.start();
        info!("resume done");
    }

    async fn start_statistics(&self) {
        let mut slot = self.statistics.lock().await;
        if slot.is_some() {
            return;
        }
        let text = serde_json::json!({
            "inputs": [{
                "type": SELF_STATISTICS_INPUT,
                "detail": {"IntervalMs": SELF_STATISTICS_INTERVAL_MS}
            }]
        })
        .to_string();
        let built = match PipelineConfig::parse("", SELF_STATISTICS_PIPELINE, SELF_STATISTICS_PIPELINE, &text) {
            Ok(config) => self.factory.build(config, CarryOver::default()).await.map_err(|f| f.error),
            Err(e) => Err(e),
        };
        match built {
            Ok(pipeline) => {
                pipeline.start();
                *slot = Some(Arc::new(pipeline));
            }
            Err(e) => error!(error = %e, "failed to start statistics pipeline"),
        }
    }

    /// `hold_on(false)`, load every `(name, document)`, `resume()`.
    /// Returns the documents that failed to load.
    pub async fn reload(&self, documents: Vec<(String, String)>) -> Vec<(String, ManagerError)> {
        self.hold_on(false).await;
        let mut failures = Vec::new();
        for (name, text) in documents {
            if let Err(e) = self.load(&name, &text).await {
                error!(pipeline = %name, error = %e, "failed to load config");
                failures.push((name, e));
            }
        }
        self.resume().await;
        failures
    }

    /// Remove `name` from the live table and stop it.
    pub async fn unload(&self, name: &str) -> bool {
        let removed = self.tables.live.write().await.remove(name);
        match removed {
            Some(pipeline) => {
                self.stop_with_timeout(pipeline, false, self.stop_deadline())
                    .await
            }
            None => false,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.tables.live.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.live.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn disabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.tables.disabled).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        lock(&self.tables.disabled).contains_key(name)
    }

    pub fn always_online(&self) -> &AlwaysOnlineManager {
        &self.always_online
    }

    pub fn sweeper(&self) -> &CheckpointSweeper {
        &self.sweeper
    }

    pub async fn export_metrics(&self) -> Vec<MetricSnapshot> {
        self.tables.export_all().await
    }
}

/// Read every `<name>.json` in `dir`, sorted by name.
pub fn read_pipeline_dir(dir: &Path) -> Result<Vec<(String, String)>, ManagerError> {
    let read_err = |source| ManagerError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut documents = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text = std::fs::read_to_string(&path).map_err(read_err)?;
        documents.push((name.to_string(), text));
    }
    documents.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{"inputs": [{"type": "metric_mock", "detail": {"IntervalMs": 50}}],
        "flushers": [{"type": "flusher_checker"}]}"#;

    fn manager() -> PipelineManager {
        manager_with(RuntimeSettings::default())
    }

    fn manager_with(runtime: RuntimeSettings) -> PipelineManager {
        PipelineManager::new(
            PluginRegistry::with_builtins(),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            GlobalConfig::default(),
            runtime,
            &CheckpointSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_load_then_resume_starts_pipeline() {
        let manager = manager();
        manager.load("a", DOC).await.unwrap();
        let pipeline = manager.get("a").await.unwrap();
        assert!(!pipeline.already_started());

        manager.resume().await;
        assert!(pipeline.already_started());
        assert!(manager.sweeper().is_running());

        manager.hold_on(true).await;
        assert!(manager.names().await.is_empty());
        assert!(!manager.sweeper().is_running());
    }

    #[tokio::test]
    async fn test_invalid_document_is_rejected() {
        let manager = manager();
        let err = manager.load("a", "{oops").await.unwrap_err();
        assert!(matches!(err, ManagerError::Pipeline(PipelineError::Json(_))));
        assert!(manager.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_document_deletes_entry() {
        let manager = manager();
        manager.load("a", DOC).await.unwrap();
        manager.load("a", "").await.unwrap();
        assert!(manager.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_reload_keeps_names() {
        let manager = manager();
        manager.load("a", DOC).await.unwrap();
        manager.load("b", DOC).await.unwrap();
        manager.resume().await;

        let failures = manager
            .reload(vec![("a".into(), DOC.into()), ("b".into(), DOC.into())])
            .await;
        assert!(failures.is_empty());
        assert_eq!(manager.names().await, vec!["a", "b"]);

        manager.hold_on(true).await;
    }

    #[tokio::test]
    async fn test_always_online_instance_is_reused() {
        let manager = manager();
        let doc = r#"{"global": {"AlwaysOnline": true},
            "inputs": [{"type": "metric_mock", "detail": {"IntervalMs": 50}}],
            "flushers": [{"type": "flusher_checker"}]}"#;
        manager.load("a", doc).await.unwrap();
        manager.resume().await;
        let before = manager.get("a").await.unwrap();

        manager.hold_on(false).await;
        assert!(manager.always_online().contains("a"));
        assert!(before.is_paused());

        manager.load("a", doc).await.unwrap();
        assert!(!manager.always_online().contains("a"));
        let after = manager.get("a").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(before.instance_id(), after.instance_id());

        manager.resume().await;
        assert!(!after.is_paused());
        manager.hold_on(true).await;
    }

    #[tokio::test]
    async fn test_statistics_pipeline_lifecycle() {
        let manager = manager_with(RuntimeSettings {
            self_statistics: true,
            ..RuntimeSettings::default()
        });
        manager.load("a", DOC).await.unwrap();
        manager.resume().await;
        assert!(manager.statistics.lock().await.is_some());
        assert!(!manager.export_metrics().await.is_empty());

        manager.hold_on(true).await;
        assert!(manager.statistics.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_statistics_checkpoints() {
        let manager = manager_with(RuntimeSettings {
            self_statistics: true,
            ..RuntimeSettings::default()
        });
        manager.load("a", DOC).await.unwrap();
        manager.resume().await;

        let statistics = manager.statistics.lock().await.clone().unwrap();
        statistics.context().save_checkpoint("offset", b"1").await.unwrap();
        let live = manager.get("a").await.unwrap();
        live.context().save_checkpoint("offset", b"2").await.unwrap();
        assert!(manager.unload("a").await);

        manager.sweeper().sweep_once().await.unwrap();
        assert_eq!(
            statistics.context().get_checkpoint("offset").await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(live.context().get_checkpoint("offset").await.unwrap(), None);

        manager.hold_on(true).await;
    }

    #[test]
    fn test_read_pipeline_dir() {
        let dir = tempfile::tempdir().unwrap();
        for (file, body) in [("b.json", "{}"), ("a.json", "{}"), ("notes.txt", "x")] {
            let mut f = std::fs::File::create(dir.path().join(file)).unwrap();
            f.write_all(body.as_bytes()).unwrap();
        }
        let docs = read_pipeline_dir(dir.path()).unwrap();
        let names: Vec<_> = docs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
