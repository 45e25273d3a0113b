//! Mutation queue
//!
//! FIFO list of pending write operations awaiting transmission, plus the set
//! of mutations parked as errored after exhausting their retry budget. The
//! queue exclusively owns its entries; the coordinator drives retries only
//! through the operations here, never by direct mutation.
//!
//! When constructed with a [`LocalStore`] the full queue contents are
//! persisted as JSON on every change and restored at startup, so work queued
//! while offline survives a hard restart.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use crate::types::PendingMutation;

const QUEUE_STORE_KEY: &str = "fieldsync.mutation_queue";

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    pending: VecDeque<PendingMutation>,
    errored: Vec<PendingMutation>,
}

/// Durable-within-session FIFO queue of pending mutations.
pub struct MutationQueue {
    state: RwLock<QueueState>,
    store: Option<Arc<dyn LocalStore>>,
}

impl MutationQueue {
    /// In-memory queue with no durability.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            store: None,
        }
    }

    /// Queue persisted to `store` on every change, restoring any contents a
    /// previous session left behind.
    pub async fn with_store(store: Arc<dyn LocalStore>) -> SyncResult<Self> {
        let state = match store.get(QUEUE_STORE_KEY).await? {
            Some(json) => {
                let state: QueueState = serde_json::from_str(&json)?;
                tracing::info!(
                    pending = state.pending.len(),
                    errored = state.errored.len(),
                    "restored mutation queue from local store"
                );
                state
            }
            None => QueueState::default(),
        };

        Ok(Self {
            state: RwLock::new(state),
            store: Some(store),
        })
    }

    async fn persist(&self, state: &QueueState) -> SyncResult<()> {
        if let Some(store) = &self.store {
            let json = serde_json::to_string(state)?;
            store.set(QUEUE_STORE_KEY, &json).await?;
        }
        Ok(())
    }

    /// Append a new mutation and return its generated id.
    pub async fn enqueue(&self, payload: serde_json::Value) -> SyncResult<Uuid> {
        let mutation = PendingMutation::new(payload);
        let id = mutation.id;

        let mut state = self.state.write().await;
        state.pending.push_back(mutation);
        self.persist(&state).await?;

        tracing::debug!(mutation_id = %id, depth = state.pending.len(), "queued mutation");
        Ok(id)
    }

    /// Oldest pending mutation, if any (the next one to send).
    pub async fn peek_front(&self) -> Option<PendingMutation> {
        self.state.read().await.pending.front().cloned()
    }

    /// Remove a mutation after the remote accepted it.
    pub async fn dequeue_on_success(&self, id: Uuid) -> SyncResult<()> {
        let mut state = self.state.write().await;
        let before = state.pending.len();
        state.pending.retain(|m| m.id != id);
        if state.pending.len() == before {
            return Err(SyncError::NotFound(format!("pending mutation {}", id)));
        }
        self.persist(&state).await?;

        tracing::debug!(mutation_id = %id, "mutation synced and dequeued");
        Ok(())
    }

    /// Record a failed attempt; returns the updated attempt count.
    pub async fn record_attempt_failure(&self, id: Uuid, error: &str) -> SyncResult<u32> {
        let mut state = self.state.write().await;
        let mutation = state
            .pending
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("pending mutation {}", id)))?;

        mutation.attempts += 1;
        mutation.last_error = Some(error.to_string());
        let attempts = mutation.attempts;
        self.persist(&state).await?;

        tracing::warn!(mutation_id = %id, attempts, error, "mutation attempt failed");
        Ok(attempts)
    }

    /// Move a mutation out of the active retry rotation into the errored set.
    pub async fn mark_errored(&self, id: Uuid) -> SyncResult<PendingMutation> {
        let mut state = self.state.write().await;
        let position = state
            .pending
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("pending mutation {}", id)))?;

        // remove preserves the invariant: never pending and errored at once
        let mutation = state
            .pending
            .remove(position)
            .ok_or_else(|| SyncError::Internal("queue position vanished".to_string()))?;
        state.errored.push(mutation.clone());
        self.persist(&state).await?;

        tracing::warn!(mutation_id = %id, "mutation moved to errored set");
        Ok(mutation)
    }

    /// Move every errored mutation back into the pending rotation with a
    /// fresh attempt budget. Returns how many were revived.
    pub async fn retry_errored(&self) -> SyncResult<usize> {
        let mut state = self.state.write().await;
        let revived = state.errored.len();
        let errored = std::mem::take(&mut state.errored);
        for mut mutation in errored {
            mutation.attempts = 0;
            mutation.last_error = None;
            state.pending.push_back(mutation);
        }
        self.persist(&state).await?;

        if revived > 0 {
            tracing::info!(revived, "errored mutations moved back to pending");
        }
        Ok(revived)
    }

    pub async fn list_pending(&self) -> Vec<PendingMutation> {
        self.state.read().await.pending.iter().cloned().collect()
    }

    pub async fn list_errored(&self) -> Vec<PendingMutation> {
        self.state.read().await.errored.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }

    pub async fn errored_count(&self) -> usize {
        self.state.read().await.errored.len()
    }

    /// User-initiated discard of a single mutation, pending or errored.
    pub async fn clear(&self, id: Uuid) -> SyncResult<bool> {
        let mut state = self.state.write().await;
        let before = state.pending.len() + state.errored.len();
        state.pending.retain(|m| m.id != id);
        state.errored.retain(|m| m.id != id);
        let removed = state.pending.len() + state.errored.len() < before;
        self.persist(&state).await?;
        Ok(removed)
    }

    /// Discard everything, pending and errored alike.
    pub async fn clear_all(&self) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.pending.clear();
        state.errored.clear();
        self.persist(&state).await?;
        Ok(())
    }

    /// Discard only the errored set (used when errors are dismissed).
    pub async fn clear_errored(&self) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.errored.clear();
        self.persist(&state).await?;
        Ok(())
    }
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}
