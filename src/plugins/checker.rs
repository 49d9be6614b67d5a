//! `flusher_checker`: keeps every flushed record in memory.
//!
//! Used by tests and demos to observe what reaches the end of a pipeline.
//! The `Block` flag makes the flusher report not-ready, which stalls the
//! flush stage until it is cleared.

use crate::model::{Batch, GroupEvents};
use crate::plugin::{
    decode_detail, ContractVersion, FlusherV1, FlusherV2, PluginContext, PluginError,
    PluginInstance, PluginRegistry,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

pub const FLUSHER_CHECKER: &str = "flusher_checker";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CheckerDetail {
    /// Handle name; defaults to the pipeline's config name.
    pub name: String,
    pub block: bool,
}

/// One record as a flusher saw it: contents plus the batch it came in.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedRecord {
    pub time: u32,
    pub contents: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub source: String,
    pub topic: String,
}

impl CapturedRecord {
    fn from_batch(batch: &Batch) -> Vec<CapturedRecord> {
        let tags: BTreeMap<String, String> = batch
            .tags
            .iter()
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect();
        batch
            .logs
            .iter()
            .map(|record| CapturedRecord {
                time: record.time,
                contents: record
                    .contents
                    .iter()
                    .map(|c| (c.key.clone(), c.value.clone()))
                    .collect(),
                tags: tags.clone(),
                source: batch.source.clone(),
                topic: batch.topic.clone(),
            })
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.contents.get(key).map(String::as_str)
    }
}

/// Shared view of one checker flusher.
#[derive(Debug, Default)]
pub struct CheckerHandle {
    blocked: AtomicBool,
    records: Mutex<Vec<CapturedRecord>>,
}

impl CheckerHandle {
    pub fn set_block(&self, block: bool) {
        self.blocked.store(block, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }

    /// Poll until at least `count` records arrived or `timeout` passed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.len() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn capture(&self, batches: impl Iterator<Item = Batch>) {
        if let Ok(mut records) = self.records.lock() {
            for batch in batches {
                records.extend(CapturedRecord::from_batch(&batch));
            }
        }
    }
}

/// Name to handle map shared by every checker built from one registry.
#[derive(Debug, Default)]
pub struct CheckerRegistry {
    handles: Mutex<HashMap<String, Arc<CheckerHandle>>>,
}

impl CheckerRegistry {
    pub fn global() -> Arc<CheckerRegistry> {
        static GLOBAL: OnceLock<Arc<CheckerRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CheckerRegistry::default())).clone()
    }

    /// The handle for `name`, created on first use.
    pub fn handle(&self, name: &str) -> Arc<CheckerHandle> {
        let mut handles = match self.handles.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles.entry(name.to_string()).or_default().clone()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CheckerHandle>> {
        self.handles.lock().ok().and_then(|mut h| h.remove(name))
    }
}

pub struct CheckerFlusher {
    detail: CheckerDetail,
    registry: Arc<CheckerRegistry>,
    handle: Option<Arc<CheckerHandle>>,
}

impl CheckerFlusher {
    pub fn new(detail: CheckerDetail, registry: Arc<CheckerRegistry>) -> Self {
        Self {
            detail,
            registry,
            handle: None,
        }
    }

    fn setup(&mut self, ctx: &PluginContext) {
        let name = if self.detail.name.is_empty() {
            ctx.config_name()
        } else {
            &self.detail.name
        };
        let handle = self.registry.handle(name);
        if self.detail.block {
            handle.set_block(true);
        }
        self.handle = Some(handle);
    }

    fn ready(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_blocked())
    }
}

#[async_trait]
impl FlusherV1 for CheckerFlusher {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.setup(ctx);
        Ok(())
    }

    fn description(&self) -> String {
        "checker flusher".to_string()
    }

    fn is_ready(&self, _project: &str, _logstore: &str, _logstore_key: i64) -> bool {
        self.ready()
    }

    async fn flush(
        &mut self,
        _project: &str,
        _logstore: &str,
        _config_name: &str,
        batches: &[Batch],
    ) -> Result<(), PluginError> {
        if let Some(handle) = &self.handle {
            handle.capture(batches.iter().cloned());
        }
        Ok(())
    }

    fn set_urgent(&mut self, _exiting: bool) {}

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl FlusherV2 for CheckerFlusher {
    fn init(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.setup(ctx);
        Ok(())
    }

    fn description(&self) -> String {
        "checker flusher v2".to_string()
    }

    fn is_ready(&self, _project: &str, _logstore: &str, _logstore_key: i64) -> bool {
        self.ready()
    }

    async fn export(&mut self, groups: &[GroupEvents]) -> Result<(), PluginError> {
        if let Some(handle) = &self.handle {
            handle.capture(groups.iter().map(GroupEvents::to_batch));
        }
        Ok(())
    }

    fn set_urgent(&mut self, _exiting: bool) {}

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

pub fn register(registry: &mut PluginRegistry, checkers: Arc<CheckerRegistry>) {
    registry.register(FLUSHER_CHECKER, move |version, detail| {
        let detail: CheckerDetail = decode_detail(FLUSHER_CHECKER, detail)?;
        let flusher = CheckerFlusher::new(detail, checkers.clone());
        Ok(match version {
            ContractVersion::V1 => PluginInstance::FlusherV1(Box::new(flusher)),
            ContractVersion::V2 => PluginInstance::FlusherV2(Box::new(flusher)),
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::model::Record;

    #[tokio::test]
    async fn test_block_flag_and_capture() {
        let checkers = Arc::new(CheckerRegistry::default());
        let detail = CheckerDetail {
            name: String::new(),
            block: true,
        };
        let mut flusher = CheckerFlusher::new(detail, checkers.clone());
        let ctx = PluginContext::new("p", "l", "pipe-a", Arc::new(CheckpointStore::new()));
        FlusherV1::init(&mut flusher, &ctx).unwrap();
        assert!(!FlusherV1::is_ready(&flusher, "p", "l", 0));

        let handle = checkers.handle("pipe-a");
        handle.set_block(false);
        assert!(FlusherV1::is_ready(&flusher, "p", "l", 0));

        let mut batch = Batch::new("t");
        batch.add_tag("__hostname__", "h");
        batch.logs.push([("content", "x")].into_iter().collect::<Record>());
        flusher.flush("p", "l", "pipe-a", &[batch]).await.unwrap();

        assert!(handle.wait_for(1, Duration::from_millis(100)).await);
        let records = handle.records();
        assert_eq!(records[0].get("content"), Some("x"));
        assert_eq!(records[0].tags.get("__hostname__").map(String::as_str), Some("h"));
        assert_eq!(records[0].topic, "t");
    }
}
