//! Sync coordinator
//!
//! Drives the mutation queue against the remote collaborator: starts a drain
//! pass when connectivity returns with pending work, sends strictly in FIFO
//! order, applies exponential backoff to transient failures, parks mutations
//! that exhaust their retry budget (or are terminally rejected) in the
//! errored set, and republishes an immutable [`SyncMetadata`] snapshot after
//! every observable transition.
//!
//! The coordinator has no terminal failure state: individual mutation
//! failures are recorded and draining continues; losing connectivity merely
//! suspends the pass until the monitor reports the link is back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fieldsync_bus::EventBus;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncEngineConfig;
use crate::error::SyncResult;
use crate::network::NetworkMonitor;
use crate::queue::MutationQueue;
use crate::remote::{MutationSender, RemoteError};
use crate::types::{SyncErrorEntry, SyncMetadata};

#[derive(Debug, Default)]
struct StatusState {
    is_syncing: bool,
    last_sync_time: Option<chrono::DateTime<Utc>>,
    errors: Vec<SyncErrorEntry>,
}

struct CoordinatorInner {
    queue: Arc<MutationQueue>,
    sender: Arc<dyn MutationSender>,
    monitor: NetworkMonitor,
    bus: EventBus<SyncMetadata>,
    config: SyncEngineConfig,
    status: parking_lot::Mutex<StatusState>,
    // Held for the duration of a drain pass; a second trigger is a no-op.
    drain_gate: tokio::sync::Mutex<()>,
}

/// Owner of the process-wide sync state machine.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[derive(PartialEq)]
enum BackoffOutcome {
    Completed,
    WentOffline,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<MutationQueue>,
        sender: Arc<dyn MutationSender>,
        monitor: NetworkMonitor,
        bus: EventBus<SyncMetadata>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                queue,
                sender,
                monitor,
                bus,
                config,
                status: parking_lot::Mutex::new(StatusState::default()),
                drain_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Watch the network monitor and resume draining whenever connectivity
    /// returns with pending work.
    pub fn spawn_network_watcher(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        // Subscribe before spawning so transitions between spawn and the
        // task's first poll are not missed.
        let mut rx = self.inner.monitor.subscribe();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let online = rx.borrow_and_update().is_online();
                if online && coordinator.inner.queue.pending_count().await > 0 {
                    tracing::info!("connectivity regained with pending mutations");
                    coordinator.trigger_drain();
                }
            }
        })
    }

    /// Kick off a drain pass in the background. No-op if one is running.
    pub fn trigger_drain(&self) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.drain().await;
        });
    }

    /// User-initiated "retry now": re-triggers draining regardless of
    /// automatic triggers.
    pub fn force_sync_refresh(&self) {
        self.trigger_drain();
    }

    /// Move all errored mutations back into the pending rotation with fresh
    /// attempt budgets, drop their error entries, and start draining.
    pub async fn retry_failed_mutations(&self) -> SyncResult<usize> {
        let revived = self.inner.queue.retry_errored().await?;
        if revived > 0 {
            self.inner.status.lock().errors.clear();
        }
        self.publish_snapshot().await;
        self.trigger_drain();
        Ok(revived)
    }

    /// Dismiss a single surfaced error, discarding its mutation. Idempotent.
    pub async fn clear_sync_error(&self, error_id: Uuid) -> SyncResult<()> {
        let mutation_id = {
            let mut status = self.inner.status.lock();
            let before = status.errors.len();
            let mutation_id = status
                .errors
                .iter()
                .find(|e| e.id == error_id)
                .map(|e| e.mutation_id);
            status.errors.retain(|e| e.id != error_id);
            if status.errors.len() == before {
                None
            } else {
                mutation_id
            }
        };

        if let Some(mutation_id) = mutation_id {
            self.inner.queue.clear(mutation_id).await?;
            self.publish_snapshot().await;
        }
        Ok(())
    }

    /// Dismiss every surfaced error and its mutation. Idempotent.
    pub async fn clear_all_sync_errors(&self) -> SyncResult<()> {
        self.inner.status.lock().errors.clear();
        self.inner.queue.clear_errored().await?;
        self.publish_snapshot().await;
        Ok(())
    }

    /// Record a terminal rejection that happened outside the drain loop
    /// (direct write-path sends).
    pub async fn record_terminal_failure(&self, mutation_id: Uuid, message: &str) {
        self.inner
            .status
            .lock()
            .errors
            .push(SyncErrorEntry::new(mutation_id, message));
        self.publish_snapshot().await;
    }

    /// Called by the write path whenever a mutation enters the queue.
    pub async fn on_mutation_queued(&self) {
        self.publish_snapshot().await;
        if self.inner.monitor.is_online() {
            self.trigger_drain();
        }
    }

    /// Current published snapshot.
    pub async fn metadata(&self) -> SyncMetadata {
        self.snapshot().await
    }

    pub fn bus(&self) -> &EventBus<SyncMetadata> {
        &self.inner.bus
    }

    async fn snapshot(&self) -> SyncMetadata {
        let pending_mutations = self.inner.queue.pending_count().await;
        let status = self.inner.status.lock();
        SyncMetadata {
            pending_mutations,
            is_syncing: status.is_syncing,
            last_sync_time: status.last_sync_time,
            errors: status.errors.clone(),
        }
    }

    async fn publish_snapshot(&self) {
        let snapshot = self.snapshot().await;
        self.inner.bus.publish(&snapshot);
    }

    async fn set_syncing(&self, syncing: bool) {
        self.inner.status.lock().is_syncing = syncing;
        self.publish_snapshot().await;
    }

    async fn drain(&self) {
        let _gate = match self.inner.drain_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => return,
        };
        if !self.inner.monitor.is_online() {
            return;
        }
        if self.inner.queue.pending_count().await == 0 {
            return;
        }

        self.set_syncing(true).await;
        tracing::info!("drain pass started");

        while let Some(mutation) = self.inner.queue.peek_front().await {
            if !self.inner.monitor.is_online() {
                tracing::info!("connectivity lost, drain suspended");
                break;
            }

            let deadline = self.inner.config.network_timeout;
            let result = match tokio::time::timeout(
                deadline,
                self.inner.sender.send(&mutation.payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::transient(format!(
                    "send timed out after {:?}",
                    deadline
                ))),
            };

            match result {
                Ok(()) => {
                    if let Err(error) = self.inner.queue.dequeue_on_success(mutation.id).await {
                        // Discarded by the user mid-send; nothing to do.
                        tracing::warn!(mutation_id = %mutation.id, %error, "dequeue after success failed");
                    }
                    self.inner.status.lock().last_sync_time = Some(Utc::now());
                    self.publish_snapshot().await;
                }
                Err(remote) if remote.is_terminal() => {
                    tracing::warn!(
                        mutation_id = %mutation.id,
                        message = %remote.message,
                        "mutation terminally rejected"
                    );
                    self.park_as_errored(mutation.id, &remote.message).await;
                }
                Err(remote) => {
                    let attempts = match self
                        .inner
                        .queue
                        .record_attempt_failure(mutation.id, &remote.message)
                        .await
                    {
                        Ok(attempts) => attempts,
                        Err(error) => {
                            tracing::warn!(mutation_id = %mutation.id, %error, "could not record attempt");
                            break;
                        }
                    };

                    if attempts >= self.inner.config.max_attempts {
                        tracing::warn!(
                            mutation_id = %mutation.id,
                            attempts,
                            "retry budget exhausted"
                        );
                        self.park_as_errored(mutation.id, &remote.message).await;
                    } else {
                        let delay = self.inner.config.backoff_delay(attempts);
                        tracing::debug!(
                            mutation_id = %mutation.id,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            "backing off before retry"
                        );
                        if self.wait_backoff(delay).await == BackoffOutcome::WentOffline {
                            tracing::info!("connectivity lost during backoff, drain suspended");
                            break;
                        }
                    }
                }
            }
        }

        self.set_syncing(false).await;
        let remaining = self.inner.queue.pending_count().await;
        tracing::info!(remaining, "drain pass finished");
    }

    async fn park_as_errored(&self, mutation_id: Uuid, message: &str) {
        match self.inner.queue.mark_errored(mutation_id).await {
            Ok(mutation) => {
                self.inner
                    .status
                    .lock()
                    .errors
                    .push(SyncErrorEntry::new(mutation.id, message));
            }
            Err(error) => {
                tracing::warn!(mutation_id = %mutation_id, %error, "could not park mutation");
            }
        }
        self.publish_snapshot().await;
    }

    async fn wait_backoff(&self, delay: Duration) -> BackoffOutcome {
        let mut rx = self.inner.monitor.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => BackoffOutcome::Completed,
            _ = async {
                if rx.wait_for(|state| !state.is_online()).await.is_err() {
                    // Monitor gone: nothing will ever report offline.
                    std::future::pending::<()>().await;
                }
            } => BackoffOutcome::WentOffline,
        }
    }
}
