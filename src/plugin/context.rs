use super::contracts::Extension;
use super::meta::{plugin_type, PluginMeta};
use crate::checkpoint::{composite_key, CheckpointError, CheckpointStore};
use crate::metrics::{
    MetricRecord, MetricRegistry, MetricSnapshot, LABEL_CONFIG_NAME, LABEL_LOGSTORE,
    LABEL_PLUGIN_ID, LABEL_PLUGIN_TYPE, LABEL_PROJECT,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

struct ContextInner {
    project: String,
    logstore: String,
    config_name: String,
    metrics: MetricRegistry,
    checkpoint: Arc<CheckpointStore>,
    runtime: CancellationToken,
    extensions: RwLock<Vec<(String, Arc<dyn Extension>)>>,
    plugins: Mutex<Vec<String>>,
}

/// The capability bundle a pipeline hands to each of its plugins.
///
/// Plugins keep a clone of the context; the pipeline owns the underlying
/// metric registry, checkpoint namespace and runtime cancellation token.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("project", &self.inner.project)
            .field("logstore", &self.inner.logstore)
            .field("config_name", &self.inner.config_name)
            .finish()
    }
}

impl PluginContext {
    pub fn new(
        project: impl Into<String>,
        logstore: impl Into<String>,
        config_name: impl Into<String>,
        checkpoint: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                project: project.into(),
                logstore: logstore.into(),
                config_name: config_name.into(),
                metrics: MetricRegistry::new(),
                checkpoint,
                runtime: CancellationToken::new(),
                extensions: RwLock::new(Vec::new()),
                plugins: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn project(&self) -> &str {
        &self.inner.project
    }

    pub fn logstore(&self) -> &str {
        &self.inner.logstore
    }

    pub fn config_name(&self) -> &str {
        &self.inner.config_name
    }

    /// Cancelled once the owning pipeline has fully stopped.
    pub fn runtime_token(&self) -> CancellationToken {
        self.inner.runtime.clone()
    }

    pub(crate) fn cancel_runtime(&self) {
        self.inner.runtime.cancel();
    }

    pub fn metrics(&self) -> &MetricRegistry {
        &self.inner.metrics
    }

    /// Labels identifying this pipeline.
    pub fn pipeline_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_PROJECT.to_string(), self.inner.project.clone());
        labels.insert(LABEL_LOGSTORE.to_string(), self.inner.logstore.clone());
        labels.insert(LABEL_CONFIG_NAME.to_string(), self.inner.config_name.clone());
        labels
    }

    /// Labels identifying one plugin of this pipeline.
    pub fn plugin_labels(&self, meta: &PluginMeta) -> BTreeMap<String, String> {
        let mut labels = self.pipeline_labels();
        labels.insert(LABEL_PLUGIN_TYPE.to_string(), meta.plugin_type.clone());
        labels.insert(LABEL_PLUGIN_ID.to_string(), meta.plugin_id.clone());
        labels
    }

    pub fn register_metric_record(&self, labels: BTreeMap<String, String>) -> Arc<MetricRecord> {
        self.inner.metrics.register(labels)
    }

    pub fn set_metric_record(&self, record: Arc<MetricRecord>) {
        self.inner.metrics.add(record);
    }

    pub fn remove_metric_record(&self, record: &Arc<MetricRecord>) {
        self.inner.metrics.remove(record);
    }

    pub fn export_metric_records(&self) -> Vec<MetricSnapshot> {
        self.inner.metrics.export()
    }

    pub async fn save_checkpoint(&self, key: &str, value: &[u8]) -> Result<(), CheckpointError> {
        let key = composite_key(&self.inner.config_name, key)?;
        self.inner.checkpoint.put(&key, value).await
    }

    /// `Ok(None)` when the key was never written (or was swept).
    pub async fn get_checkpoint(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError> {
        let key = composite_key(&self.inner.config_name, key)?;
        self.inner.checkpoint.get(&key).await
    }

    pub async fn delete_checkpoint(&self, key: &str) -> Result<(), CheckpointError> {
        let key = composite_key(&self.inner.config_name, key)?;
        self.inner.checkpoint.delete(&key).await
    }

    pub(crate) fn add_extension(&self, type_with_id: &str, extension: Arc<dyn Extension>) {
        let mut extensions = match self.inner.extensions.write() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        extensions.retain(|(name, _)| name != type_with_id);
        extensions.push((type_with_id.to_string(), extension));
    }

    /// Resolve an extension by `type/id`, or by bare type when the name has
    /// no id (the first extension of that type wins).
    pub fn get_extension(&self, name: &str) -> Option<Arc<dyn Extension>> {
        let extensions = match self.inner.extensions.read() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((_, ext)) = extensions.iter().find(|(n, _)| n == name) {
            return Some(ext.clone());
        }
        if name.contains('/') {
            return None;
        }
        extensions
            .iter()
            .find(|(n, _)| plugin_type(n) == name)
            .map(|(_, ext)| ext.clone())
    }

    pub(crate) fn extensions(&self) -> Vec<(String, Arc<dyn Extension>)> {
        match self.inner.extensions.read() {
            Ok(e) => e.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Record that a plugin type is part of this pipeline.
    pub fn add_plugin(&self, plugin_type: &str) {
        if let Ok(mut plugins) = self.inner.plugins.lock() {
            plugins.push(plugin_type.to_string());
        }
    }

    pub fn plugins(&self) -> Vec<String> {
        self.inner
            .plugins
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}
