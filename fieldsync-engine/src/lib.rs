//! Offline-first data synchronization engine for field clients
//!
//! Keeps an interactive application reading and writing while disconnected
//! and reconciles with the backend once connectivity returns. Provides:
//! - Network quality detection (online / slow / offline)
//! - Cache-first reads with timeout-bounded network refresh
//! - An offline write queue with retry, backoff, and replay
//! - A pub/sub snapshot of sync state for UI surfaces
//!
//! The engine is domain-agnostic: payloads and query results are opaque
//! JSON values, and the remote API and persistent store are collaborator
//! traits supplied by the application.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod mutate;
pub mod network;
pub mod queue;
pub mod remote;
pub mod store;
pub mod types;

pub use config::SyncEngineConfig;
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use fetch::{FetchOptions, QueryClient};
pub use mutate::{MutationClient, OptimisticUpdate};
pub use network::{ConnectivityProbe, NetworkMonitor, NetworkState, NetworkStatus, ProbeSample};
pub use queue::MutationQueue;
pub use remote::{MutationSender, RemoteError, RemoteErrorKind};
pub use store::{LocalStore, SqliteStore, SqliteStoreConfig};
pub use types::{
    DataSource, FetchOutcome, PendingMutation, SyncErrorEntry, SyncMetadata, WriteOutcome,
};

pub use fieldsync_bus::{EventBus, Subscription};

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

/// The assembled engine: one instance per application (or per tenant).
pub struct SyncEngine {
    monitor: NetworkMonitor,
    queries: QueryClient,
    mutations: MutationClient,
    coordinator: SyncCoordinator,
    watcher: JoinHandle<()>,
}

impl SyncEngine {
    /// Wire up the engine around the application's remote collaborator and
    /// optional persistent store. Work queued by a previous session is
    /// restored from the store and drained once connectivity allows.
    pub async fn new(
        config: SyncEngineConfig,
        sender: Arc<dyn MutationSender>,
        store: Option<Arc<dyn LocalStore>>,
    ) -> SyncResult<Self> {
        let monitor = NetworkMonitor::new();
        let bus = EventBus::new();

        let queue = Arc::new(match &store {
            Some(store) => MutationQueue::with_store(Arc::clone(store)).await?,
            None => MutationQueue::new(),
        });

        let coordinator = SyncCoordinator::new(
            Arc::clone(&queue),
            Arc::clone(&sender),
            monitor.clone(),
            bus,
            config.clone(),
        );
        let watcher = coordinator.spawn_network_watcher();

        let queries = QueryClient::new(monitor.clone(), config.clone(), store.clone());
        let mutations = MutationClient::new(
            queue,
            sender,
            monitor.clone(),
            coordinator.clone(),
            config,
        );

        // Restored offline work should not wait for the next connectivity
        // transition.
        coordinator.trigger_drain();

        Ok(Self {
            monitor,
            queries,
            mutations,
            coordinator,
            watcher,
        })
    }

    /// Offline-first read (see [`QueryClient::fetch`]).
    pub async fn fetch<F, Fut>(
        &self,
        query_key: &str,
        query_fn: F,
        options: FetchOptions,
    ) -> SyncResult<FetchOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<serde_json::Value>> + Send + 'static,
    {
        self.queries.fetch(query_key, query_fn, options).await
    }

    /// Offline-capable write (see [`MutationClient::mutate`]).
    pub async fn mutate(
        &self,
        payload: serde_json::Value,
        optimistic: Option<&dyn OptimisticUpdate>,
    ) -> SyncResult<WriteOutcome> {
        self.mutations.mutate(payload, optimistic).await
    }

    /// Current sync state snapshot.
    pub async fn metadata(&self) -> SyncMetadata {
        self.coordinator.metadata().await
    }

    /// Observe sync state changes without polling.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<SyncMetadata>
    where
        F: Fn(&SyncMetadata) + Send + Sync + 'static,
    {
        self.coordinator.bus().subscribe(callback)
    }

    /// User-initiated "sync now".
    pub fn refresh(&self) {
        self.coordinator.force_sync_refresh();
    }

    /// Put errored mutations back into rotation and drain.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        self.coordinator.retry_failed_mutations().await
    }

    /// Dismiss one surfaced error and discard its mutation.
    pub async fn clear_error(&self, error_id: Uuid) -> SyncResult<()> {
        self.coordinator.clear_sync_error(error_id).await
    }

    /// Dismiss all surfaced errors.
    pub async fn clear_all_errors(&self) -> SyncResult<()> {
        self.coordinator.clear_all_sync_errors().await
    }

    /// Connectivity feed: push probe samples and read classification here.
    pub fn network(&self) -> &NetworkMonitor {
        &self.monitor
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct AcceptAll {
        calls: StdMutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl MutationSender for AcceptAll {
        async fn send(&self, payload: &serde_json::Value) -> Result<(), RemoteError> {
            self.calls.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn offline_mutation_replays_after_reconnect() {
        let remote = Arc::new(AcceptAll {
            calls: StdMutex::new(Vec::new()),
        });
        let engine = SyncEngine::new(SyncEngineConfig::default(), remote.clone(), None)
            .await
            .unwrap();

        let snapshots = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&snapshots);
        let _sub = engine.subscribe(move |meta| seen.lock().unwrap().push(meta.clone()));

        engine.network().report_sample(ProbeSample::offline());
        let outcome = engine
            .mutate(serde_json::json!({"id": "m1", "payload": {"x": 1}}), None)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Queued { .. }));

        let meta = engine.metadata().await;
        assert_eq!(meta.pending_mutations, 1);
        assert!(!meta.is_syncing);

        engine.network().report_sample(ProbeSample::online());
        for _ in 0..500 {
            if engine.metadata().await.pending_mutations == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let meta = engine.metadata().await;
        assert_eq!(meta.pending_mutations, 0);
        assert!(meta.last_sync_time.is_some());
        assert_eq!(remote.calls.lock().unwrap().len(), 1);

        let snapshots = snapshots.lock().unwrap();
        assert!(snapshots.len() >= 2);
        assert!(snapshots.iter().any(|m| m.pending_mutations == 1));
        assert!(snapshots.iter().any(|m| m.pending_mutations == 0));
    }

    #[tokio::test]
    async fn engine_serves_reads_through_cache() {
        let remote = Arc::new(AcceptAll {
            calls: StdMutex::new(Vec::new()),
        });
        let engine = SyncEngine::new(SyncEngineConfig::default(), remote, None)
            .await
            .unwrap();
        engine.network().report_sample(ProbeSample::online());

        let outcome = engine
            .fetch(
                "patients",
                || async { Ok(serde_json::json!([{"id": 1}])) },
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.source, DataSource::Network);

        let outcome = engine
            .fetch(
                "patients",
                || async { Ok(serde_json::json!("not called")) },
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(outcome.data, serde_json::json!([{"id": 1}]));
    }
}
