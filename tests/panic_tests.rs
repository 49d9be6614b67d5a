/// Panic isolation in the process stage
///
/// A processor that panics loses the records it was handed; the stage keeps
/// running and later records still reach the flusher.

use logferry::checkpoint::CheckpointStore;
use logferry::config::{CheckpointSettings, GlobalConfig, RuntimeSettings};
use logferry::manager::PipelineManager;
use logferry::model::Record;
use logferry::plugin::{
    ContractVersion, PluginContext, PluginError, PluginInstance, PluginKind, PluginRegistry,
    ProcessorV1,
};
use logferry::plugins::checker::CheckerRegistry;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;

    /// Panics on any record whose content is "boom".
    struct Fragile;

    impl ProcessorV1 for Fragile {
        fn init(&mut self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }

        fn description(&self) -> String {
            "fragile processor".to_string()
        }

        fn process_logs(&mut self, logs: Vec<Record>) -> Vec<Record> {
            if logs.iter().any(|r| r.get("content") == Some("boom")) {
                panic!("fragile processor hit a bad record");
            }
            logs
        }
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::with_builtins();
        registry.register("processor_fragile", |version, _detail| match version {
            ContractVersion::V1 => Ok(PluginInstance::ProcessorV1(Box::new(Fragile))),
            ContractVersion::V2 => Err(PluginError::Unsupported {
                plugin: "processor_fragile".to_string(),
                kind: PluginKind::Processor,
                version,
            }),
        });
        registry
    }

    #[tokio::test]
    async fn test_process_stage_survives_processor_panic() {
        let manager = PipelineManager::new(
            registry(),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            GlobalConfig::default(),
            RuntimeSettings::default(),
            &CheckpointSettings::default(),
        );
        let doc = serde_json::json!({
            "global": {"AggregatIntervalMs": 20},
            "inputs": [{"type": "service_mock", "detail": {"Fields": {"content": "first"}, "Count": 1}}],
            "processors": [{"type": "processor_fragile"}],
            "aggregators": [{"type": "aggregator_default"}],
            "flushers": [{"type": "flusher_checker"}]
        })
        .to_string();
        manager.load("panic_isolation", &doc).await.unwrap();
        manager.resume().await;
        let pipeline = manager.get("panic_isolation").await.unwrap();
        let handle = CheckerRegistry::global().handle("panic_isolation");

        assert!(handle.wait_for(1, Duration::from_secs(5)).await);

        pipeline.process_raw_log(b"boom", "", "").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.len(), 1);

        pipeline.process_raw_log(b"second", "", "").await;
        assert!(handle.wait_for(2, Duration::from_secs(5)).await);
        let contents: Vec<String> = handle
            .records()
            .iter()
            .map(|r| r.get("content").unwrap_or_default().to_string())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);

        manager.hold_on(true).await;
    }
}
