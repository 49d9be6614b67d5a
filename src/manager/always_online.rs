use crate::pipeline::Pipeline;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often expired entries are looked for.
pub const EVICT_TICK: Duration = Duration::from_secs(3);

struct Cached {
    pipeline: Arc<Pipeline>,
    added_at: Instant,
    timeout: Duration,
}

impl Cached {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.added_at) >= self.timeout
    }
}

/// Paused-but-warm pipelines waiting to be reclaimed by a reload.
///
/// Entries that are not reclaimed within their timeout are stopped by a
/// background task.
pub struct AlwaysOnlineManager {
    entries: Arc<Mutex<HashMap<String, Cached>>>,
    tick: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Default for AlwaysOnlineManager {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(entries: &Mutex<HashMap<String, Cached>>) -> MutexGuard<'_, HashMap<String, Cached>> {
    match entries.lock() {
        Ok(e) => e,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Stop an evicted pipeline without blocking the caller.
fn stop_in_background(pipeline: Arc<Pipeline>) {
    tokio::spawn(async move {
        pipeline.stop(false).await;
        info!(pipeline = %pipeline.name(), "always-online config stopped");
    });
}

impl AlwaysOnlineManager {
    pub fn new() -> Self {
        Self::with_tick(EVICT_TICK)
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            tick,
            task: Mutex::new(None),
        }
    }

    /// Cache a paused pipeline. A previous entry under the same name is
    /// stopped.
    pub fn add(&self, pipeline: Arc<Pipeline>, timeout: Duration) {
        let name = pipeline.name().to_string();
        info!(pipeline = %name, timeout = ?timeout, "add always-online config");
        let old = lock(&self.entries).insert(
            name,
            Cached {
                pipeline,
                added_at: Instant::now(),
                timeout,
            },
        );
        if let Some(old) = old {
            stop_in_background(old.pipeline);
        }
    }

    /// Remove and return the cached pipeline for `name`.
    pub fn take(&self, name: &str) -> Option<Arc<Pipeline>> {
        lock(&self.entries).remove(name).map(|c| c.pipeline)
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.entries).contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Remove and return every entry whose name is not in `existing`.
    pub fn take_deleted(&self, existing: &HashSet<String>) -> Vec<Arc<Pipeline>> {
        let mut entries = lock(&self.entries);
        let deleted: Vec<String> = entries
            .keys()
            .filter(|name| !existing.contains(*name))
            .cloned()
            .collect();
        deleted
            .into_iter()
            .filter_map(|name| entries.remove(&name))
            .map(|c| c.pipeline)
            .collect()
    }

    /// Remove and return every entry.
    pub fn take_all(&self) -> Vec<Arc<Pipeline>> {
        lock(&self.entries).drain().map(|(_, c)| c.pipeline).collect()
    }

    fn evict_expired(entries: &Mutex<HashMap<String, Cached>>) -> Vec<Arc<Pipeline>> {
        let now = Instant::now();
        let mut entries = lock(entries);
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, c)| c.expired(now))
            .map(|(name, _)| name.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|name| entries.remove(&name))
            .map(|c| c.pipeline)
            .collect()
    }

    /// Start the eviction task; a running task is left alone.
    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let cancel = token.clone();
        let entries = self.entries.clone();
        let tick = self.tick;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {
                        for pipeline in Self::evict_expired(&entries) {
                            info!(pipeline = %pipeline.name(), "always-online config timed out");
                            stop_in_background(pipeline);
                        }
                    }
                }
            }
            debug!("always-online eviction stopped");
        });
        *task = Some((token, handle));
    }

    /// Stop the eviction task. Cached pipelines stay in place.
    pub async fn shutdown(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::{GlobalConfig, RuntimeSettings};
    use crate::pipeline::{PipelineConfig, PipelineFactory};
    use crate::plugin::PluginRegistry;
    use crate::runner::CarryOver;

    const DOC: &str = r#"{"global": {"AlwaysOnline": true}, "inputs": [{"type": "metric_mock"}]}"#;

    async fn pipeline(name: &str) -> Arc<Pipeline> {
        let factory = PipelineFactory::new(
            PluginRegistry::with_builtins(),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            GlobalConfig::default(),
            RuntimeSettings::default(),
        );
        let config = PipelineConfig::parse("", name, name, DOC).unwrap();
        Arc::new(factory.build(config, CarryOver::default()).await.unwrap())
    }

    #[tokio::test]
    async fn test_add_take_and_replace() {
        let cache = AlwaysOnlineManager::new();
        let first = pipeline("a").await;
        cache.add(first.clone(), Duration::from_secs(60));
        assert!(cache.contains("a"));

        let second = pipeline("a").await;
        cache.add(second.clone(), Duration::from_secs(60));
        assert_eq!(cache.len(), 1);

        let taken = cache.take("a").unwrap();
        assert!(Arc::ptr_eq(&taken, &second));
        assert!(cache.is_empty());
        assert!(cache.take("a").is_none());
    }

    #[tokio::test]
    async fn test_take_deleted_keeps_existing() {
        let cache = AlwaysOnlineManager::new();
        cache.add(pipeline("keep").await, Duration::from_secs(60));
        cache.add(pipeline("gone").await, Duration::from_secs(60));

        let existing: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let deleted = cache.take_deleted(&existing);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name(), "gone");
        assert_eq!(cache.names(), vec!["keep"]);

        assert_eq!(cache.take_all().len(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted() {
        let cache = AlwaysOnlineManager::with_tick(Duration::from_millis(20));
        cache.add(pipeline("short").await, Duration::ZERO);
        cache.add(pipeline("long").await, Duration::from_secs(60));
        cache.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.names(), vec!["long"]);
        cache.shutdown().await;
    }
}
