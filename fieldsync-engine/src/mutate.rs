//! Offline-capable write path
//!
//! Applies the caller's optimistic local effect, attempts the remote send,
//! and falls back to queueing when the network is absent or flaky. The
//! optimistic protocol is explicit and two-phase: `apply` happens before the
//! network attempt, then exactly one of `commit` (remote accepted) or
//! `rollback` (terminal rejection) once the true outcome is known. A queued
//! mutation keeps its optimistic effect but the caller is told `Queued`, not
//! `Applied` — the data is not durably saved yet and must not be presented
//! as such.

use std::sync::Arc;

use tokio::time::timeout;
use uuid::Uuid;

use crate::config::SyncEngineConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::queue::MutationQueue;
use crate::remote::{MutationSender, RemoteError};
use crate::types::WriteOutcome;

/// Caller-side hooks for optimistic UI state.
///
/// `apply` fires before any network activity; `commit` confirms the effect,
/// `rollback` undoes it after a terminal rejection. For a queued mutation
/// neither fires: the effect stays visible while the work is pending.
pub trait OptimisticUpdate: Send + Sync {
    fn apply(&self);
    fn commit(&self);
    fn rollback(&self);
}

/// Write-side entry point.
#[derive(Clone)]
pub struct MutationClient {
    queue: Arc<MutationQueue>,
    sender: Arc<dyn MutationSender>,
    monitor: NetworkMonitor,
    coordinator: SyncCoordinator,
    config: SyncEngineConfig,
}

impl MutationClient {
    pub fn new(
        queue: Arc<MutationQueue>,
        sender: Arc<dyn MutationSender>,
        monitor: NetworkMonitor,
        coordinator: SyncCoordinator,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            queue,
            sender,
            monitor,
            coordinator,
            config,
        }
    }

    /// Issue a write. Online sends go straight to the remote; offline or
    /// transiently-failing sends are queued for replay.
    pub async fn mutate(
        &self,
        payload: serde_json::Value,
        optimistic: Option<&dyn OptimisticUpdate>,
    ) -> SyncResult<WriteOutcome> {
        if let Some(update) = optimistic {
            update.apply();
        }

        if !self.monitor.is_online() {
            tracing::debug!("offline, queueing mutation for replay");
            return self.enqueue(payload).await;
        }

        let deadline = self.config.network_timeout;
        let result = match timeout(deadline, self.sender.send(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::transient(format!(
                "send timed out after {:?}",
                deadline
            ))),
        };

        match result {
            Ok(()) => {
                if let Some(update) = optimistic {
                    update.commit();
                }
                Ok(WriteOutcome::Applied)
            }
            Err(remote) if remote.is_terminal() => {
                if let Some(update) = optimistic {
                    update.rollback();
                }
                // Surfaced immediately, no retry budget consumed.
                let mutation_ref = Uuid::new_v4();
                self.coordinator
                    .record_terminal_failure(mutation_ref, &remote.message)
                    .await;
                Err(SyncError::Rejected(remote.message))
            }
            Err(remote) => {
                tracing::debug!(error = %remote.message, "transient send failure, queueing mutation");
                self.enqueue(payload).await
            }
        }
    }

    async fn enqueue(&self, payload: serde_json::Value) -> SyncResult<WriteOutcome> {
        let id = self.queue.enqueue(payload).await?;
        self.coordinator.on_mutation_queued().await;
        Ok(WriteOutcome::Queued { id })
    }
}
