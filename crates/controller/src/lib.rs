//! KubeSync controller: reconciles watched objects into their storages and reports the
//! progress back onto them.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kubesync_core::{ErrorList, ObjectKey};
use kubesync_state::StateError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

mod queue;
mod reconciler;
#[cfg(test)]
mod testing;
mod update;

pub use queue::{backoff, WorkQueue, DEFAULT_MAX_BACKOFF};
pub use reconciler::{PersisterSet, Reconciler, StorageBinding};
pub use update::{update_with_retry, RETRY_LIMIT};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("error fetching resource from cluster: {0}")]
    Fetch(#[source] kube::Error),
    #[error("error updating object: {0}")]
    Update(#[source] kube::Error),
    #[error("error writing state for object (using state type '{kind}'): {source}")]
    State { kind: &'static str, source: StateError },
    /// A failed pass; holds the failure and, if projecting it onto the object failed too,
    /// that error.
    #[error("{0}")]
    Failed(ErrorList),
    #[error("invalid sync configuration '{id}': {reason}")]
    InvalidSyncConfig { id: String, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub workers: usize,
    pub max_backoff: Duration,
}

impl WorkerOptions {
    /// `KUBESYNC_REQUEUE_MAX_SECS` caps the requeue backoff of failed passes.
    pub fn from_env(workers: usize) -> Self {
        let max_backoff = std::env::var("KUBESYNC_REQUEUE_MAX_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_BACKOFF);
        Self { workers, max_backoff }
    }
}

/// Queues the keys from `events` and reconciles them with a fixed pool of workers.
///
/// Returns after the event sender is dropped and every queued key was processed. Retries
/// still waiting for their backoff at that point are dropped.
pub async fn run(reconciler: Arc<Reconciler>, mut events: mpsc::Receiver<ObjectKey>, opts: WorkerOptions) {
    let queue = Arc::new(WorkQueue::new(opts.max_backoff));
    let mut workers = JoinSet::new();
    for n in 0..opts.workers.max(1) {
        workers.spawn(work(n, Arc::clone(&reconciler), Arc::clone(&queue)));
    }
    info!(id = %reconciler.id(), workers = opts.workers.max(1), "controller started");
    while let Some(key) = events.recv().await {
        queue.push(key);
    }
    debug!(id = %reconciler.id(), "event stream closed, draining queue");
    queue.close();
    while workers.join_next().await.is_some() {}
    info!(id = %reconciler.id(), "controller stopped");
}

async fn work(n: usize, reconciler: Arc<Reconciler>, queue: Arc<WorkQueue>) {
    while let Some(key) = queue.pop().await {
        let res = reconciler.reconcile(&key).await;
        if let Err(e) = &res {
            warn!(worker = n, id = %reconciler.id(), resource = %key, error = %e, "reconcile failed");
        }
        if let Some(delay) = queue.done(&key, res.is_ok()) {
            debug!(resource = %key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.push(key);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{widget, FakeClient};
    use kube::core::GroupVersionKind;
    use kubesync_config::{FileSystemConfiguration, StorageType};
    use kubesync_core::{BasicTransformer, ResourceKey};
    use kubesync_persist::{MockPersister, PersistContext, Persister};
    use kubesync_state::{AnnotationStateDisplay, Phase, StateDisplay, Verbosity};

    #[tokio::test]
    async fn workers_sync_every_delivered_key() {
        let client = Arc::new(FakeClient::with(widget("team", "a", 1)));
        client.insert(widget("team", "b", 2));
        let store = Arc::new(MockPersister::new(&FileSystemConfiguration::default()));
        let gvk = GroupVersionKind::gvk("example.org", "v1", "Widget");
        let display: Arc<dyn StateDisplay> = Arc::new(AnnotationStateDisplay::new(Verbosity::Phase));
        let storage = StorageBinding { name: "sink".into(), storage_type: StorageType::Mock, sub_path: String::new(), persister: store.clone() };
        let reconciler = Reconciler::from_parts("widgets", gvk.clone(), client.clone(), vec![storage], Some(display.clone()), Arc::new(BasicTransformer::new()), true);

        let (tx, rx) = mpsc::channel(8);
        for name in ["a", "b", "a"] {
            tx.send(ObjectKey::new(Some("team"), name)).await.unwrap();
        }
        drop(tx);
        run(Arc::new(reconciler), rx, WorkerOptions { workers: 2, max_backoff: DEFAULT_MAX_BACKOFF }).await;

        for (name, generation) in [("a", 1), ("b", 2)] {
            let stored = client.stored(&ObjectKey::new(Some("team"), name)).unwrap();
            let state = display.read(&stored).unwrap();
            assert_eq!(state.phase, Phase::Finished);
            assert_eq!(state.last_synced_generation, generation);
            let key = ResourceKey::new(name, Some("team"), gvk.clone(), "");
            assert!(store.exists(&PersistContext::none(), &key).unwrap());
        }
    }

    #[test]
    fn requeue_cap_comes_from_env() {
        std::env::set_var("KUBESYNC_REQUEUE_MAX_SECS", "7");
        assert_eq!(WorkerOptions::from_env(3).max_backoff, Duration::from_secs(7));
        std::env::remove_var("KUBESYNC_REQUEUE_MAX_SECS");
        assert_eq!(WorkerOptions::from_env(3).max_backoff, DEFAULT_MAX_BACKOFF);
    }
}
