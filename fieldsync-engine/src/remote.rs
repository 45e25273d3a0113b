//! Remote API collaborator boundary
//!
//! The engine defines no wire protocol of its own. Reads are caller-supplied
//! async closures (see the read path); writes go through [`MutationSender`],
//! which the application implements over its GraphQL/REST client. All the
//! engine requires is success/failure signaling plus a transient/terminal
//! classification so it knows whether retrying can ever help.

use async_trait::async_trait;
use thiserror::Error;

/// How a remote failure should be treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Timeout, 5xx-equivalent, connection reset: retry with backoff.
    Transient,
    /// The remote explicitly rejected the payload: retrying cannot succeed.
    Terminal,
}

/// Failure reported by the remote collaborator.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == RemoteErrorKind::Terminal
    }
}

/// Write-side collaborator: applies one opaque mutation payload remotely.
#[async_trait]
pub trait MutationSender: Send + Sync {
    async fn send(&self, payload: &serde_json::Value) -> Result<(), RemoteError>;
}
