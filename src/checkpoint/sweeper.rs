use super::key::split_composite_key;
use super::store::CheckpointStore;
use super::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decides which pipelines still own their checkpoint entries.
#[async_trait]
pub trait RetentionPolicy: Send + Sync {
    /// Pipeline names whose entries must survive a sweep.
    async fn retained_pipelines(&self) -> HashSet<String>;
}

/// Background task deleting checkpoint entries of pipelines that are gone.
///
/// Each pass deletes at most `max_items` entries: keys that cannot be parsed
/// and keys whose pipeline is not retained by the policy.
pub struct CheckpointSweeper {
    store: Arc<CheckpointStore>,
    policy: Arc<dyn RetentionPolicy>,
    interval: Duration,
    max_items: usize,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CheckpointSweeper {
    pub fn new(
        store: Arc<CheckpointStore>,
        policy: Arc<dyn RetentionPolicy>,
        interval: Duration,
        max_items: usize,
    ) -> Self {
        Self {
            store,
            policy,
            interval,
            max_items,
            task: Mutex::new(None),
        }
    }

    /// Start the periodic sweep. A running sweeper is left untouched.
    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let store = self.store.clone();
        let policy = self.policy.clone();
        let interval = self.interval;
        let max_items = self.max_items;
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            info!(interval = ?interval, max_items, "checkpoint sweeper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match sweep(&store, policy.as_ref(), max_items).await {
                            Ok(0) => debug!("checkpoint sweep found nothing to delete"),
                            Ok(deleted) => info!(deleted, "checkpoint sweep deleted stale entries"),
                            Err(e) => warn!(error = %e, "checkpoint sweep failed"),
                        }
                    }
                }
            }
            info!("checkpoint sweeper stopped");
        });
        *task = Some((token, handle));
    }

    /// Stop the sweeper and wait for the running pass to finish.
    pub async fn stop(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "checkpoint sweeper task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Run one pass immediately.
    pub async fn sweep_once(&self) -> Result<usize> {
        sweep(&self.store, self.policy.as_ref(), self.max_items).await
    }
}

async fn sweep(
    store: &CheckpointStore,
    policy: &dyn RetentionPolicy,
    max_items: usize,
) -> Result<usize> {
    let retained = policy.retained_pipelines().await;
    let doomed: Vec<String> = store
        .keys()
        .await?
        .into_iter()
        .filter(|key| match split_composite_key(key) {
            Some((pipeline, _)) => !retained.contains(pipeline),
            None => true,
        })
        .take(max_items)
        .collect();

    for key in &doomed {
        debug!(key = %key, "deleting stale checkpoint");
    }
    store.delete_many(doomed).await
}
