// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stepfleet-core.

use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the shared KV store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    /// The store was unreachable and the client's bounded retries were
    /// exhausted. Callers may retry the whole operation.
    #[error("transient KV error: {0}")]
    Transient(String),

    /// The store answered, but the command failed.
    #[error("KV backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded into the expected shape.
    #[error("KV decode error: {0}")]
    Decode(String),

    /// The subscription connection is gone and will not be re-established.
    #[error("KV subscription closed")]
    SubscriptionClosed,
}

/// Core errors that can occur while driving sessions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// KV store operation failed.
    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored record violated the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session has no persisted state.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// The session is terminated and must not be resumed.
    #[error("session '{0}' is terminated")]
    SessionTerminated(String),

    /// The lease on a session was lost to another manager.
    #[error("lease on session '{session_id}' lost to {holder:?}")]
    LeaseLost {
        /// The session whose lease was lost.
        session_id: String,
        /// Current holder, if one could be read.
        holder: Option<String>,
    },

    /// Step execution failed. The queue applies retry/backoff.
    #[error("step execution failed: {0}")]
    Executor(String),

    /// A queued job record was missing or corrupt.
    #[error("job '{job_id}' unreadable: {reason}")]
    JobUnreadable {
        /// The job id.
        job_id: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl CoreError {
    /// True when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Kv(KvError::Transient(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CoreError::Kv(KvError::Transient("down".into())).is_transient());
        assert!(!CoreError::Kv(KvError::Backend("bad type".into())).is_transient());
        assert!(!CoreError::Executor("boom".into()).is_transient());
    }

    #[test]
    fn kv_error_converts() {
        let err: CoreError = KvError::SubscriptionClosed.into();
        assert!(matches!(err, CoreError::Kv(KvError::SubscriptionClosed)));
    }
}
