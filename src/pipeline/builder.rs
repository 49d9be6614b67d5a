use super::document::{MixProcessMode, PipelineConfig, PipelineDocument, PluginEntry};
use super::{Pipeline, PipelineError};
use crate::checkpoint::CheckpointStore;
use crate::config::{GlobalConfig, RuntimeSettings};
use crate::plugin::{
    ContractVersion, PluginContext, PluginError, PluginIdGenerator, PluginInstance, PluginKind,
    PluginMeta, PluginRegistry,
};
use crate::runner::{CarryOver, PluginOptions, RunnerBuilder, RunnerContext};
use crate::wrapper::guard_sync;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Aggregator inserted when a document configures none.
pub const DEFAULT_AGGREGATOR: &str = "aggregator_default";

/// Input queue size for documents in file mix mode.
const FILE_MODE_INPUT_QUEUE: usize = 10;

/// A failed build, handing back the carry-over it was given.
#[derive(Debug)]
pub struct BuildFailure {
    pub error: PipelineError,
    pub carry_over: CarryOver,
}

/// Turns pipeline documents into runnable pipelines.
#[derive(Clone)]
pub struct PipelineFactory {
    registry: PluginRegistry,
    checkpoint: Arc<CheckpointStore>,
    defaults: GlobalConfig,
    runtime: RuntimeSettings,
}

fn interval_override(detail: Option<&Value>) -> Option<Duration> {
    detail?
        .get("IntervalMs")?
        .as_u64()
        .map(Duration::from_millis)
}

fn wrong_kind(meta: &PluginMeta, expected: &str) -> PipelineError {
    PipelineError::ConfigInvalid(format!(
        "plugin {} is not {}",
        meta.plugin_type_with_id, expected
    ))
}

impl PipelineFactory {
    pub fn new(
        registry: PluginRegistry,
        checkpoint: Arc<CheckpointStore>,
        defaults: GlobalConfig,
        runtime: RuntimeSettings,
    ) -> Self {
        Self {
            registry,
            checkpoint,
            defaults,
            runtime,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub fn defaults(&self) -> &GlobalConfig {
        &self.defaults
    }

    /// The document's `global` section over the process-wide defaults.
    pub fn resolve_global(&self, document: &PipelineDocument) -> Result<GlobalConfig, PipelineError> {
        let mut global = match &document.global {
            Some(value) => self.defaults.overlay(value).map_err(|e| {
                PipelineError::ConfigInvalid(format!("invalid global section: {}", e))
            })?,
            None => self.defaults.clone(),
        };
        if self.runtime.always_online_for_stdout && document.has_docker_stdout_input() {
            global.always_online = true;
        }
        if global.default_log_queue_size == 0 || global.default_log_group_queue_size == 0 {
            return Err(PipelineError::ConfigInvalid(
                "queue sizes must be greater than 0".to_string(),
            ));
        }
        Ok(global)
    }

    /// Build a pipeline. `carry_over` is replayed into the new flush queue on
    /// start; on failure every constructed plugin is stopped and the
    /// carry-over is returned untouched.
    pub async fn build(
        &self,
        config: PipelineConfig,
        carry_over: CarryOver,
    ) -> Result<Pipeline, BuildFailure> {
        let global = match self.resolve_global(&config.document) {
            Ok(global) => global,
            Err(error) => return Err(BuildFailure { error, carry_over }),
        };
        let Some(version) = ContractVersion::parse(&global.structure_type) else {
            return Err(BuildFailure {
                error: PipelineError::VersionMismatch(global.structure_type.clone()),
                carry_over,
            });
        };

        let input_queue_size = match config.document.mix_mode() {
            Some(MixProcessMode::File) => {
                info!(pipeline = %config.name, "no inputs in config, limiting input queue size");
                FILE_MODE_INPUT_QUEUE
            }
            _ => global.default_log_queue_size,
        };

        let context = PluginContext::new(
            &config.project,
            &config.logstore,
            &config.name,
            self.checkpoint.clone(),
        );
        let runner_context = Arc::new(RunnerContext::new(
            context.clone(),
            global.clone(),
            config.logstore_key(),
            self.runtime.max_flush_out_time,
        ));
        let mut builder = RunnerBuilder::new(
            version,
            runner_context,
            input_queue_size,
            global.default_log_group_queue_size,
            carry_over,
        );

        if let Err(error) = self.load_plugins(&config, &global, &context, version, &mut builder) {
            error!(pipeline = %config.name, error = %error, "failed to load pipeline plugins");
            let carry_over = builder.rollback().await;
            return Err(BuildFailure { error, carry_over });
        }

        Ok(Pipeline::new(config, global, builder.build()))
    }

    fn create(
        &self,
        meta: &PluginMeta,
        version: ContractVersion,
        entry: &PluginEntry,
    ) -> Result<PluginInstance, PluginError> {
        self.registry
            .create(&meta.plugin_type, version, entry.detail.as_ref())
    }

    fn load_plugins(
        &self,
        config: &PipelineConfig,
        global: &GlobalConfig,
        context: &PluginContext,
        version: ContractVersion,
        builder: &mut RunnerBuilder,
    ) -> Result<(), PipelineError> {
        let document = &config.document;
        let ids = PluginIdGenerator::new();

        // Extensions come first so other plugins can resolve them in init.
        for entry in &document.extensions {
            let meta = ids.gen_plugin_meta(&entry.type_with_id, false, false);
            debug!(pipeline = %config.name, plugin = %meta.plugin_type_with_id, "add extension");
            let PluginInstance::Extension(mut extension) = self.create(&meta, version, entry)? else {
                return Err(wrong_kind(&meta, "an extension"));
            };
            let description = extension.description();
            guard_sync(&description, || extension.init(context)).unwrap_or_else(|| {
                Err(PluginError::init_failed(&meta.plugin_type, "panic in init"))
            })?;
            context.add_extension(&meta.plugin_type_with_id, Arc::from(extension));
            context.add_plugin(&meta.plugin_type);
        }

        for entry in &document.inputs {
            let meta = ids.gen_plugin_meta(&entry.type_with_id, true, false);
            let instance = self.create(&meta, version, entry)?;
            if !instance.kind().is_input() {
                return Err(wrong_kind(&meta, "an input"));
            }
            let options = PluginOptions {
                interval: interval_override(entry.detail.as_ref())
                    .unwrap_or_else(|| global.input_interval()),
                priority: 0,
            };
            context.add_plugin(&meta.plugin_type);
            builder.add_plugin(meta, instance, options)?;
        }

        for (index, entry) in document.processors.iter().enumerate() {
            let meta = ids.gen_plugin_meta(&entry.type_with_id, true, false);
            let instance = match self.create(&meta, version, entry) {
                Err(PluginError::UnknownType(plugin)) => {
                    error!(
                        alarm = "INVALID_PROCESSOR_TYPE",
                        pipeline = %config.name,
                        plugin = %plugin,
                        "invalid processor type, maybe type is wrong or the agent is too old"
                    );
                    continue;
                }
                other => other?,
            };
            if instance.kind() != PluginKind::Processor {
                return Err(wrong_kind(&meta, "a processor"));
            }
            let options = PluginOptions {
                interval: Duration::ZERO,
                priority: index as i32,
            };
            context.add_plugin(&meta.plugin_type);
            builder.add_plugin(meta, instance, options)?;
        }

        let aggregate = PluginOptions {
            interval: global.aggregate_interval(),
            priority: 0,
        };
        for entry in &document.aggregators {
            let meta = ids.gen_plugin_meta(&entry.type_with_id, true, false);
            let instance = match self.create(&meta, version, entry) {
                Err(PluginError::UnknownType(plugin)) => {
                    error!(
                        alarm = "INVALID_AGGREGATOR_TYPE",
                        pipeline = %config.name,
                        plugin = %plugin,
                        "invalid aggregator type, maybe type is wrong or the agent is too old"
                    );
                    continue;
                }
                other => other?,
            };
            if instance.kind() != PluginKind::Aggregator {
                return Err(wrong_kind(&meta, "an aggregator"));
            }
            context.add_plugin(&meta.plugin_type);
            builder.add_plugin(meta, instance, aggregate)?;
        }
        if builder.aggregator_count() == 0 {
            let meta = ids.gen_plugin_meta(DEFAULT_AGGREGATOR, true, false);
            let instance = self.registry.create(DEFAULT_AGGREGATOR, version, None)?;
            debug!(pipeline = %config.name, "add default aggregator");
            builder.add_plugin(meta, instance, aggregate)?;
        }

        let flusher_options = PluginOptions {
            interval: Duration::ZERO,
            priority: 0,
        };
        let last = document.flushers.len().saturating_sub(1);
        for (index, entry) in document.flushers.iter().enumerate() {
            let meta = ids.gen_plugin_meta(&entry.type_with_id, true, index == last);
            let instance = self.create(&meta, version, entry)?;
            if instance.kind() != PluginKind::Flusher {
                return Err(wrong_kind(&meta, "a flusher"));
            }
            context.add_plugin(&meta.plugin_type);
            builder.add_plugin(meta, instance, flusher_options)?;
        }
        if builder.flusher_count() == 0 {
            let default_flusher = self.runtime.default_flusher.as_str();
            let meta = ids.gen_plugin_meta(default_flusher, true, true);
            let instance = self.registry.create(default_flusher, version, None)?;
            debug!(pipeline = %config.name, flusher = %default_flusher, "add default flusher");
            builder.add_plugin(meta, instance, flusher_options)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory() -> PipelineFactory {
        PipelineFactory::new(
            PluginRegistry::with_builtins(),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            GlobalConfig::default(),
            RuntimeSettings::default(),
        )
    }

    fn config(name: &str, text: &str) -> PipelineConfig {
        PipelineConfig::parse("proj", "store", name, text).unwrap()
    }

    #[test]
    fn test_interval_override() {
        let detail = json!({"IntervalMs": 250});
        assert_eq!(
            interval_override(Some(&detail)),
            Some(Duration::from_millis(250))
        );
        assert_eq!(interval_override(Some(&json!({}))), None);
        assert_eq!(interval_override(None), None);
    }

    #[test]
    fn test_resolve_global_inherits_defaults() {
        let factory = factory();
        let doc = PipelineDocument::parse(r#"{"inputs": []}"#).unwrap();
        assert_eq!(factory.resolve_global(&doc).unwrap(), GlobalConfig::default());

        let doc = PipelineDocument::parse(r#"{"global": {"DelayStopSec": 5}}"#).unwrap();
        let global = factory.resolve_global(&doc).unwrap();
        assert_eq!(global.delay_stop_sec, 5);
        assert_eq!(global.default_log_queue_size, 1000);
    }

    #[test]
    fn test_stdout_input_forces_always_online() {
        let runtime = RuntimeSettings {
            always_online_for_stdout: true,
            ..RuntimeSettings::default()
        };
        let factory = PipelineFactory::new(
            PluginRegistry::new(),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            GlobalConfig::default(),
            runtime,
        );
        let doc =
            PipelineDocument::parse(r#"{"inputs": [{"type": "service_docker_stdout"}]}"#).unwrap();
        assert!(factory.resolve_global(&doc).unwrap().always_online);
    }

    #[tokio::test]
    async fn test_build_inserts_defaults() {
        let pipeline = factory()
            .build(
                config("demo", r#"{"inputs": [{"type": "metric_mock"}]}"#),
                CarryOver::default(),
            )
            .await
            .unwrap();

        let plugins = pipeline.context().plugins();
        assert_eq!(plugins, vec!["metric_mock"]);
        assert_eq!(pipeline.version(), ContractVersion::V1);
        assert!(!pipeline.already_started());
        // statistics + input + default aggregator + default flusher
        assert_eq!(pipeline.export_metric_records().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_processor_is_skipped() {
        let pipeline = factory()
            .build(
                config(
                    "demo",
                    r#"{"inputs": [{"type": "metric_mock"}],
                        "processors": [{"type": "processor_nowhere"}, {"type": "processor_add_fields"}]}"#,
                ),
                CarryOver::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            pipeline.context().plugins(),
            vec!["metric_mock", "processor_add_fields"]
        );
    }

    #[tokio::test]
    async fn test_unknown_flusher_fails_and_returns_carry_over() {
        let carry = CarryOver::Batches(vec![crate::model::Batch::new("left")]);
        let failure = factory()
            .build(
                config(
                    "demo",
                    r#"{"inputs": [{"type": "metric_mock"}], "flushers": [{"type": "flusher_nowhere"}]}"#,
                ),
                carry,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            PipelineError::PluginInitFailed(PluginError::UnknownType(_))
        ));
        assert_eq!(failure.carry_over.len(), 1);
    }

    #[tokio::test]
    async fn test_v1_only_plugin_rejected_in_v2_pipeline() {
        let failure = factory()
            .build(
                config(
                    "demo",
                    r#"{"global": {"StructureType": "v2"},
                        "inputs": [{"type": "metric_mock"}],
                        "processors": [{"type": "processor_regex", "detail": {"SourceKey": "content", "Regex": "x"}}]}"#,
                ),
                CarryOver::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            PipelineError::PluginInitFailed(PluginError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_structure_type() {
        let failure = factory()
            .build(
                config("demo", r#"{"global": {"StructureType": "v9"}}"#),
                CarryOver::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(failure.error, PipelineError::VersionMismatch(_)));
    }
}
