//! Offline-first read path
//!
//! Orchestrates cache-first reads with network refresh:
//!
//! 1. Fresh cache hit: returned immediately, no network call.
//! 2. Stale cache hit: returned immediately with a background refresh when
//!    enabled and connectivity exists; otherwise refreshed in the foreground,
//!    falling back to the stale value if the network lets us down.
//! 3. Cache miss: the persistent local store is consulted as a fallback (the
//!    in-memory cache is empty after a reload), then the network is tried.
//! 4. Offline with nothing cached anywhere surfaces an error; errors are
//!    otherwise swallowed and logged whenever any data could be served.
//!
//! At most one network attempt per query key is in flight at a time;
//! concurrent callers for the same key await the existing attempt. A timed
//! out or aborted attempt never writes into the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::cache::QueryCache;
use crate::config::SyncEngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::store::LocalStore;
use crate::types::{DataSource, FetchOutcome};

const STORE_KEY_PREFIX: &str = "fieldsync.query.";

/// Per-call fetch options.
#[derive(Default)]
pub struct FetchOptions {
    /// Skip the cache entirely and demand a network round trip.
    pub force_network: bool,
    /// Per-query TTL override; defaults to the engine-wide `cache_time`.
    pub cache_time: Option<Duration>,
    /// Caller-supplied abort signal; firing it short-circuits an in-flight
    /// fetch without corrupting cache state.
    pub abort: Option<oneshot::Receiver<()>>,
}

type FetchSlot = Option<Result<serde_json::Value, FetchFailure>>;

/// Cloneable failure handed to de-duplicated callers, preserving the
/// classification the leader's caller saw.
#[derive(Debug, Clone)]
enum FetchFailure {
    Timeout(Duration),
    Aborted,
    Other(String),
}

impl FetchFailure {
    fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::Timeout(deadline) => FetchFailure::Timeout(*deadline),
            SyncError::Aborted => FetchFailure::Aborted,
            other => FetchFailure::Other(other.to_string()),
        }
    }

    fn into_error(self) -> SyncError {
        match self {
            FetchFailure::Timeout(deadline) => SyncError::Timeout(deadline),
            FetchFailure::Aborted => SyncError::Aborted,
            FetchFailure::Other(message) => SyncError::Network(message),
        }
    }
}

struct ClientInner {
    cache: QueryCache,
    monitor: NetworkMonitor,
    config: SyncEngineConfig,
    store: Option<Arc<dyn LocalStore>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<FetchSlot>>>,
}

/// Offline-first query client. Exclusively owns the in-memory cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

enum Role {
    Leader(watch::Sender<FetchSlot>),
    Follower(watch::Receiver<FetchSlot>),
}

struct InFlightGuard {
    inner: Arc<ClientInner>,
    query_key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.query_key);
    }
}

impl QueryClient {
    pub fn new(
        monitor: NetworkMonitor,
        config: SyncEngineConfig,
        store: Option<Arc<dyn LocalStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                cache: QueryCache::new(),
                monitor,
                config,
                store,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fetch `query_key`, preferring cached data and refreshing from the
    /// network when connectivity and policy allow.
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
        let ttl = options.cache_time.unwrap_or(self.inner.config.cache_time);

        if !options.force_network {
            if let Some(hit) = self.inner.cache.lookup(query_key, ttl) {
                if !hit.is_stale {
                    tracing::debug!(query_key, age_ms = hit.age.as_millis() as u64, "cache hit");
                    return Ok(FetchOutcome {
                        data: hit.data,
                        source: DataSource::Cache,
                    });
                }

                if !self.inner.monitor.is_online() {
                    // Stale beats nothing while offline.
                    return Ok(FetchOutcome {
                        data: hit.data,
                        source: DataSource::Cache,
                    });
                }

                if self.inner.config.enable_background_refresh {
                    self.spawn_refresh(query_key.to_string(), query_fn);
                    return Ok(FetchOutcome {
                        data: hit.data,
                        source: DataSource::Cache,
                    });
                }

                // Foreground refresh, stale value as the safety net.
                return match self.network_fetch(query_key, query_fn, options.abort).await {
                    Ok(data) => Ok(FetchOutcome {
                        data,
                        source: DataSource::Network,
                    }),
                    Err(error) => {
                        tracing::warn!(query_key, %error, "refresh failed, serving stale data");
                        Ok(FetchOutcome {
                            data: hit.data,
                            source: DataSource::Cache,
                        })
                    }
                };
            }
        }

        if self.inner.monitor.is_online() {
            // No in-memory entry (or the caller forced the network).
            let local = if options.force_network {
                None
            } else {
                self.load_local(query_key).await
            };

            match self.network_fetch(query_key, query_fn, options.abort).await {
                Ok(data) => {
                    return Ok(FetchOutcome {
                        data,
                        source: DataSource::Network,
                    })
                }
                Err(error) => {
                    if let Some(data) = local {
                        tracing::warn!(query_key, %error, "fetch failed, serving local store data");
                        return Ok(FetchOutcome {
                            data,
                            source: DataSource::Local,
                        });
                    }
                    return Err(error);
                }
            }
        }

        // Offline: a forced network round trip cannot be honored, so degrade
        // to the best available data like any other offline read.
        if options.force_network {
            if let Some(hit) = self.inner.cache.lookup(query_key, ttl) {
                return Ok(FetchOutcome {
                    data: hit.data,
                    source: DataSource::Cache,
                });
            }
        }

        if let Some(data) = self.load_local(query_key).await {
            return Ok(FetchOutcome {
                data,
                source: DataSource::Local,
            });
        }

        Err(SyncError::NoDataAvailable(query_key.to_string()))
    }

    /// Number of cached entries (observability only).
    pub fn cached_queries(&self) -> usize {
        self.inner.cache.len()
    }

    async fn load_local(&self, query_key: &str) -> Option<serde_json::Value> {
        let store = self.inner.store.as_ref()?;
        let key = format!("{}{}", STORE_KEY_PREFIX, query_key);
        match store.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::warn!(query_key, %error, "corrupt local store entry ignored");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(query_key, %error, "local store read failed");
                None
            }
        }
    }

    fn spawn_refresh<F, Fut>(&self, query_key: String, query_fn: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<serde_json::Value>> + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            match client.network_fetch(&query_key, query_fn, None).await {
                Ok(_) => tracing::debug!(query_key, "background refresh complete"),
                Err(error) => {
                    tracing::warn!(query_key, %error, "background refresh failed")
                }
            }
        });
    }

    /// Run the network attempt for a key, de-duplicating concurrent callers.
    async fn network_fetch<F, Fut>(
        &self,
        query_key: &str,
        query_fn: F,
        abort: Option<oneshot::Receiver<()>>,
    ) -> SyncResult<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<serde_json::Value>>,
    {
        let role = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(query_key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(query_key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                tracing::debug!(query_key, "awaiting existing in-flight fetch");
                loop {
                    if let Some(result) = rx.borrow_and_update().clone() {
                        return result.map_err(FetchFailure::into_error);
                    }
                    if rx.changed().await.is_err() {
                        return Err(SyncError::Internal(
                            "in-flight fetch abandoned".to_string(),
                        ));
                    }
                }
            }
            Role::Leader(tx) => {
                // Removes the entry even if this future is dropped mid-fetch,
                // so a cancelled leader cannot leave the key wedged.
                let _in_flight_guard = InFlightGuard {
                    inner: Arc::clone(&self.inner),
                    query_key: query_key.to_string(),
                };
                let result = self.run_query(query_fn(), abort).await;

                if let Ok(data) = &result {
                    self.inner.cache.insert(query_key, data.clone());
                    self.write_through(query_key, data).await;
                }

                let slot = match &result {
                    Ok(data) => Ok(data.clone()),
                    Err(error) => Err(FetchFailure::from_error(error)),
                };
                let _ = tx.send(Some(slot));
                result
            }
        }
    }

    async fn run_query<Fut>(
        &self,
        fut: Fut,
        abort: Option<oneshot::Receiver<()>>,
    ) -> SyncResult<serde_json::Value>
    where
        Fut: Future<Output = SyncResult<serde_json::Value>>,
    {
        let deadline = self.inner.config.network_timeout;
        let timed = tokio::time::timeout(deadline, fut);
        match abort {
            Some(mut abort) => {
                tokio::pin!(timed);
                tokio::select! {
                    outcome = &mut timed => match outcome {
                        Ok(result) => result,
                        Err(_) => Err(SyncError::Timeout(deadline)),
                    },
                    fired = &mut abort => {
                        if fired.is_ok() {
                            return Err(SyncError::Aborted);
                        }
                        // Abort handle dropped without firing: wait out the fetch.
                        match timed.await {
                            Ok(result) => result,
                            Err(_) => Err(SyncError::Timeout(deadline)),
                        }
                    }
                }
            }
            None => match timed.await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(deadline)),
            },
        }
    }

    async fn write_through(&self, query_key: &str, data: &serde_json::Value) {
        if let Some(store) = &self.inner.store {
            let key = format!("{}{}", STORE_KEY_PREFIX, query_key);
            if let Err(error) = store.set(&key, &data.to_string()).await {
                tracing::warn!(query_key, %error, "local store write-through failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ProbeSample;
    use crate::store::{SqliteStore, SqliteStoreConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    fn online_client(config: SyncEngineConfig) -> QueryClient {
        let monitor = NetworkMonitor::new();
        monitor.report_sample(ProbeSample::online());
        QueryClient::new(monitor, config, None)
    }

    fn counting_query(
        calls: &Arc<AtomicUsize>,
        value: serde_json::Value,
    ) -> impl FnOnce() -> std::pin::Pin<
        Box<dyn Future<Output = SyncResult<serde_json::Value>> + Send>,
    > + Send
           + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(value) })
        }
    }

    #[tokio::test]
    async fn network_fetch_populates_cache() {
        let client = online_client(SyncEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = client
            .fetch(
                "patients",
                counting_query(&calls, serde_json::json!([1])),
                FetchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.source, DataSource::Network);
        assert_eq!(outcome.data, serde_json::json!([1]));
        assert_eq!(client.cached_queries(), 1);
    }

    #[tokio::test]
    async fn fresh_cache_hit_triggers_no_network_call() {
        let client = online_client(SyncEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        client
            .fetch(
                "patients",
                counting_query(&calls, serde_json::json!([1])),
                FetchOptions::default(),
            )
            .await
            .unwrap();

        // Entry is one call old, well under the 5 minute TTL.
        let outcome = client
            .fetch(
                "patients",
                counting_query(&calls, serde_json::json!([2])),
                FetchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(outcome.data, serde_json::json!([1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entry_triggers_foreground_refresh_when_background_disabled() {
        let config = SyncEngineConfig {
            enable_background_refresh: false,
            ..Default::default()
        };
        let client = online_client(config);
        let calls = Arc::new(AtomicUsize::new(0));

        client
            .fetch(
                "visits",
                counting_query(&calls, serde_json::json!(1)),
                FetchOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = client
            .fetch(
                "visits",
                counting_query(&calls, serde_json::json!(2)),
                FetchOptions {
                    cache_time: Some(Duration::ZERO),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.source, DataSource::Network);
        assert_eq!(outcome.data, serde_json::json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_entry_served_with_background_refresh() {
        let client = online_client(SyncEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        client
            .fetch(
                "visits",
                counting_query(&calls, serde_json::json!("old")),
                FetchOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = client
            .fetch(
                "visits",
                counting_query(&calls, serde_json::json!("new")),
                FetchOptions {
                    cache_time: Some(Duration::ZERO),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Caller is served the stale value without blocking.
        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(outcome.data, serde_json::json!("old"));

        // The refresh lands in the cache shortly after.
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let refreshed = client
            .fetch(
                "visits",
                counting_query(&calls, serde_json::json!("ignored")),
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(refreshed.data, serde_json::json!("new"));
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_network_call() {
        let client = online_client(SyncEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_query = |calls: Arc<AtomicUsize>| {
            move || -> std::pin::Pin<
                Box<dyn Future<Output = SyncResult<serde_json::Value>> + Send>,
            > {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(serde_json::json!({"shared": true}))
                })
            }
        };

        let (a, b) = tokio::join!(
            client.fetch("roster", slow_query(Arc::clone(&calls)), FetchOptions::default()),
            client.fetch("roster", slow_query(Arc::clone(&calls)), FetchOptions::default()),
        );

        assert_eq!(a.unwrap().data, serde_json::json!({"shared": true}));
        assert_eq!(b.unwrap().data, serde_json::json!({"shared": true}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_cache_and_failing_network_surfaces_error() {
        let client = online_client(SyncEngineConfig::default());

        let result = client
            .fetch(
                "missing",
                || async { Err(SyncError::Network("503".to_string())) },
                FetchOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(SyncError::Network(_))));
        assert_eq!(client.cached_queries(), 0);
    }

    #[tokio::test]
    async fn offline_with_no_data_anywhere_is_an_error() {
        let monitor = NetworkMonitor::new();
        monitor.report_sample(ProbeSample::offline());
        let client = QueryClient::new(monitor, SyncEngineConfig::default(), None);

        let result = client
            .fetch(
                "missing",
                || async { Ok(serde_json::json!({})) },
                FetchOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(SyncError::NoDataAvailable(_))));
    }

    #[tokio::test]
    async fn offline_falls_back_to_local_store() {
        let temp_file = NamedTempFile::new().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(
            SqliteStore::new(SqliteStoreConfig {
                db_path: temp_file.path().to_str().unwrap().to_string(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        store
            .set("fieldsync.query.patients", r#"{"cached":"yes"}"#)
            .await
            .unwrap();

        let monitor = NetworkMonitor::new();
        monitor.report_sample(ProbeSample::offline());
        let client = QueryClient::new(monitor, SyncEngineConfig::default(), Some(store));

        let outcome = client
            .fetch(
                "patients",
                || async { Ok(serde_json::json!({})) },
                FetchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.source, DataSource::Local);
        assert_eq!(outcome.data, serde_json::json!({"cached": "yes"}));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_query_times_out_without_touching_cache() {
        let client = online_client(SyncEngineConfig {
            network_timeout: Duration::from_secs(1),
            ..Default::default()
        });

        let result = client
            .fetch(
                "slow",
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(serde_json::json!("too late"))
                },
                FetchOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(SyncError::Timeout(_))));
        assert_eq!(client.cached_queries(), 0);
    }

    #[tokio::test]
    async fn abort_signal_short_circuits_fetch() {
        let client = online_client(SyncEngineConfig::default());
        let (abort_tx, abort_rx) = oneshot::channel();

        let fetch = client.fetch(
            "slow",
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(serde_json::json!("never"))
            },
            FetchOptions {
                abort: Some(abort_rx),
                ..Default::default()
            },
        );

        let _ = abort_tx.send(());
        let result = fetch.await;
        assert!(matches!(result, Err(SyncError::Aborted)));
        assert_eq!(client.cached_queries(), 0);
    }

    #[tokio::test]
    async fn force_network_bypasses_fresh_cache() {
        let client = online_client(SyncEngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        client
            .fetch(
                "patients",
                counting_query(&calls, serde_json::json!(1)),
                FetchOptions::default(),
            )
            .await
            .unwrap();

        let outcome = client
            .fetch(
                "patients",
                counting_query(&calls, serde_json::json!(2)),
                FetchOptions {
                    force_network: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.source, DataSource::Network);
        assert_eq!(outcome.data, serde_json::json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_network_while_offline_serves_cached_data() {
        let monitor = NetworkMonitor::new();
        monitor.report_sample(ProbeSample::online());
        let client = QueryClient::new(monitor.clone(), SyncEngineConfig::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));

        client
            .fetch(
                "patients",
                counting_query(&calls, serde_json::json!(1)),
                FetchOptions::default(),
            )
            .await
            .unwrap();

        monitor.report_sample(ProbeSample::offline());
        let outcome = client
            .fetch(
                "patients",
                counting_query(&calls, serde_json::json!(2)),
                FetchOptions {
                    force_network: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The forced round trip cannot happen offline; cached data wins
        // over an error.
        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(outcome.data, serde_json::json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_fetch_releases_the_key() {
        let client = online_client(SyncEngineConfig::default());

        let hung = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .fetch(
                        "roster",
                        || async {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(serde_json::json!("never"))
                        },
                        FetchOptions::default(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        hung.abort();
        let _ = hung.await;

        // The key is free again: a later fetch leads its own attempt.
        let outcome = client
            .fetch(
                "roster",
                || async { Ok(serde_json::json!("fresh")) },
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.source, DataSource::Network);
        assert_eq!(outcome.data, serde_json::json!("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicated_caller_sees_timeout_classification() {
        let client = online_client(SyncEngineConfig {
            network_timeout: Duration::from_secs(1),
            ..Default::default()
        });

        let slow_query = || -> std::pin::Pin<
            Box<dyn Future<Output = SyncResult<serde_json::Value>> + Send>,
        > {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(serde_json::json!("late"))
            })
        };

        let (a, b) = tokio::join!(
            client.fetch("slow", slow_query, FetchOptions::default()),
            client.fetch("slow", slow_query, FetchOptions::default()),
        );

        // Both callers get the structured timeout, not a stringly error.
        assert!(matches!(a, Err(SyncError::Timeout(_))));
        assert!(matches!(b, Err(SyncError::Timeout(_))));
    }
}
