/// Backpressure at the input boundary
///
/// A service input that emits through the blocking collector must stall, not
/// drop, while the flusher is not ready.

use async_trait::async_trait;
use logferry::checkpoint::CheckpointStore;
use logferry::config::{CheckpointSettings, GlobalConfig, RuntimeSettings};
use logferry::manager::PipelineManager;
use logferry::model::{Record, RecordContext};
use logferry::plugin::{
    Collector, ContractVersion, PluginContext, PluginError, PluginInstance, PluginKind,
    PluginRegistry, ServiceInputV1,
};
use logferry::plugins::checker::CheckerRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    const TOTAL: u64 = 1000;

    /// Emits `TOTAL` numbered records as fast as the collector accepts them.
    struct CountingService {
        emitted: Arc<AtomicU64>,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl ServiceInputV1 for CountingService {
        fn init(&mut self, _ctx: &PluginContext) -> Result<u64, PluginError> {
            Ok(0)
        }

        fn description(&self) -> String {
            "counting service".to_string()
        }

        async fn start(&self, collector: Arc<dyn Collector>) -> Result<(), PluginError> {
            for n in 0..TOTAL {
                if self.shutdown.is_cancelled() {
                    break;
                }
                let mut record = Record::new();
                record.push("n", n.to_string());
                collector.add_record(record, RecordContext::default()).await;
                self.emitted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), PluginError> {
            self.shutdown.cancel();
            Ok(())
        }
    }

    fn registry(emitted: Arc<AtomicU64>) -> PluginRegistry {
        let mut registry = PluginRegistry::with_builtins();
        registry.register("service_counting", move |version, _detail| match version {
            ContractVersion::V1 => Ok(PluginInstance::ServiceInputV1(Box::new(CountingService {
                emitted: emitted.clone(),
                shutdown: CancellationToken::new(),
            }))),
            ContractVersion::V2 => Err(PluginError::Unsupported {
                plugin: "service_counting".to_string(),
                kind: PluginKind::ServiceInput,
                version,
            }),
        });
        registry
    }

    #[tokio::test]
    async fn test_blocking_input_stalls_without_drop() {
        let emitted = Arc::new(AtomicU64::new(0));
        let manager = PipelineManager::new(
            registry(emitted.clone()),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            GlobalConfig::default(),
            RuntimeSettings::default(),
            &CheckpointSettings::default(),
        );
        let doc = serde_json::json!({
            "global": {
                "AggregatIntervalMs": 20,
                "DefaultLogQueueSize": 1,
                "DefaultLogGroupQueueSize": 1
            },
            "inputs": [{"type": "service_counting"}],
            "aggregators": [{"type": "aggregator_default", "detail": {"MaxLogCount": 1}}],
            "flushers": [{"type": "flusher_checker", "detail": {"Block": true}}]
        })
        .to_string();
        manager.load("backpressure_input", &doc).await.unwrap();
        manager.resume().await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let stalled = emitted.load(Ordering::SeqCst);
        assert!(stalled < 50, "input was not held back: {}", stalled);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(emitted.load(Ordering::SeqCst), stalled);

        let handle = CheckerRegistry::global().handle("backpressure_input");
        assert!(handle.is_empty());
        handle.set_block(false);
        assert!(handle.wait_for(TOTAL as usize, Duration::from_secs(20)).await);

        let numbers: Vec<u64> = handle
            .records()
            .iter()
            .map(|r| r.get("n").unwrap().parse().unwrap())
            .collect();
        assert_eq!(numbers, (0..TOTAL).collect::<Vec<_>>());
        assert_eq!(emitted.load(Ordering::SeqCst), TOTAL);

        manager.hold_on(true).await;
    }
}
