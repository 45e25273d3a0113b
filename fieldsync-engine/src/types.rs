//! Shared data types
//!
//! The engine is domain-agnostic: mutation payloads and query results are
//! opaque `serde_json::Value`s. Everything here is serializable so the queue
//! can be persisted across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A write operation waiting to be replayed against the remote API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Unique operation ID, generated at enqueue time.
    pub id: Uuid,

    /// Opaque payload handed to the remote collaborator verbatim.
    pub payload: serde_json::Value,

    /// When the mutation entered the queue.
    pub queued_at: DateTime<Utc>,

    /// Number of send attempts so far. Only ever increases, except for an
    /// explicit user-initiated retry which resets it to zero.
    pub attempts: u32,

    /// Last failure message, if any attempt has failed.
    pub last_error: Option<String>,
}

impl PendingMutation {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            queued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// A surfaced synchronization failure requiring user visibility.
///
/// Created when a mutation exhausts its retry budget or is terminally
/// rejected; cleared only by explicit user action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub id: Uuid,
    /// The mutation this error belongs to.
    pub mutation_id: Uuid,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl SyncErrorEntry {
    pub fn new(mutation_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mutation_id,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Immutable snapshot of engine sync state published to observers.
///
/// This is the only state external observers may read. The coordinator
/// republishes a fresh copy after every transition; subscribers never see a
/// half-updated value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Mutations queued and awaiting transmission (excludes errored ones).
    pub pending_mutations: usize,
    /// Whether a drain pass is currently sending.
    pub is_syncing: bool,
    /// Completion time of the most recent fully-drained pass.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Failures awaiting explicit user retry or discard.
    pub errors: Vec<SyncErrorEntry>,
}

/// Where the data returned by a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// In-memory cache entry.
    Cache,
    /// Persistent local store fallback.
    Local,
    /// Fresh network response.
    Network,
}

/// Result of a read-path fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub data: serde_json::Value,
    pub source: DataSource,
}

/// What the write path tells its caller.
///
/// "Queued" is deliberately distinct from "Applied": a queued mutation has
/// not been durably persisted remotely yet, and callers must not present it
/// as saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The remote accepted the mutation.
    Applied,
    /// No connectivity (or a transient failure); the mutation is queued for
    /// replay and will be sent once connectivity returns.
    Queued { id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_mutation_starts_clean() {
        let m = PendingMutation::new(serde_json::json!({"x": 1}));
        assert_eq!(m.attempts, 0);
        assert!(m.last_error.is_none());
        assert!(!m.id.is_nil());
    }

    #[test]
    fn metadata_serializes() {
        let meta = SyncMetadata {
            pending_mutations: 2,
            is_syncing: true,
            last_sync_time: Some(Utc::now()),
            errors: vec![SyncErrorEntry::new(Uuid::new_v4(), "rejected")],
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: SyncMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pending_mutations, 2);
        assert_eq!(back.errors.len(), 1);
    }
}
