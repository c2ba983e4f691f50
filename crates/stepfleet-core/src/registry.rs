// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session registry: persisted per-session state, step history, and
//! connection bookkeeping.
//!
//! Every record lives in the KV store under the session-keyed namespace;
//! hosts cache nothing. History has two representations: a bounded
//! most-recent list for client display and a complete timestamp-ordered
//! set, the recovery oracle.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::kv::KvStore;
use crate::lease::lock_key;
use crate::session::{now_millis, SessionState, SessionStatus, Step};

/// TTL on every per-session record, refreshed on write.
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

/// Capacity of the bounded recent-steps list.
pub const RECENT_STEPS_CAP: i64 = 100;

/// Key of the gateway-side transport id.
pub fn connection_key(session_id: &str) -> String {
    format!("session:connection:{session_id}")
}

/// Key of the bounded recent-steps list.
pub fn steps_key(session_id: &str) -> String {
    format!("session:steps:{session_id}")
}

/// Key of the complete timestamp-ordered history set.
pub fn history_key(session_id: &str) -> String {
    format!("session:history:{session_id}")
}

/// Key of the session state hash.
pub fn state_key(session_id: &str) -> String {
    format!("session:state:{session_id}")
}

/// Scan pattern matching every session state key.
pub const STATE_KEY_PATTERN: &str = "session:state:*";

/// Extract the session id from a state key.
pub fn session_from_state_key(key: &str) -> Option<&str> {
    key.strip_prefix("session:state:")
}

/// Persisted session records over any [`KvStore`].
#[derive(Clone)]
pub struct SessionRegistry {
    kv: Arc<dyn KvStore>,
}

impl SessionRegistry {
    /// Create a registry over the given store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Register a (re)connecting client: bind the transport id and create
    /// the state record when absent. Idempotent; an existing session only
    /// gets its TTLs refreshed.
    pub async fn create_or_touch(&self, session_id: &str, connection_id: &str) -> Result<()> {
        self.kv
            .put(&connection_key(session_id), connection_id, Some(SESSION_TTL))
            .await?;

        let existing = self.kv.hash_read_all(&state_key(session_id)).await?;
        if existing.is_empty() {
            self.kv
                .hash_write(
                    &state_key(session_id),
                    &[
                        ("status", SessionStatus::Connected.as_str().to_string()),
                        ("last_active_time", now_millis().to_string()),
                        ("total_steps", "0".to_string()),
                    ],
                    Some(SESSION_TTL),
                )
                .await?;
        } else {
            self.kv.expire(&state_key(session_id), SESSION_TTL).await?;
            self.kv.expire(&steps_key(session_id), SESSION_TTL).await?;
            self.kv
                .expire(&history_key(session_id), SESSION_TTL)
                .await?;
        }
        debug!(session_id, connection_id, "session registered");
        Ok(())
    }

    /// Overwrite the status and bump `last_active_time`. The `error` field
    /// is written only when provided; recovery progress messages travel
    /// through it as well.
    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut fields = vec![
            ("status", status.as_str().to_string()),
            ("last_active_time", now_millis().to_string()),
        ];
        if let Some(error) = error {
            fields.push(("error", error.to_string()));
        }
        self.kv
            .hash_write(&state_key(session_id), &fields, Some(SESSION_TTL))
            .await?;
        Ok(())
    }

    /// Record the job id that exhausted its retries.
    pub async fn record_failed_job(&self, session_id: &str, job_id: &str) -> Result<()> {
        self.kv
            .hash_write(
                &state_key(session_id),
                &[("failed_job_id", job_id.to_string())],
                Some(SESSION_TTL),
            )
            .await?;
        Ok(())
    }

    /// Mark a session terminated with a reason. Used by the idle reaper;
    /// intentionally touches only the state hash, never queues or leases.
    pub async fn terminate(&self, session_id: &str, reason: &str) -> Result<()> {
        self.kv
            .hash_write(
                &state_key(session_id),
                &[
                    ("status", SessionStatus::Terminated.as_str().to_string()),
                    ("termination_reason", reason.to_string()),
                    ("last_active_time", now_millis().to_string()),
                ],
                Some(SESSION_TTL),
            )
            .await?;
        Ok(())
    }

    /// Append a completed step: head-insert into the bounded list, add to
    /// the ordered set scored by completion time, then sync `total_steps`
    /// to the set cardinality so duplicate-tolerant replays keep the count
    /// equal to the history length.
    pub async fn log_step_completion(&self, session_id: &str, step: &Step) -> Result<()> {
        let serialized = serde_json::to_string(step)?;

        self.kv
            .list_push_head(&steps_key(session_id), &serialized)
            .await?;
        self.kv
            .list_trim(&steps_key(session_id), 0, RECENT_STEPS_CAP - 1)
            .await?;
        self.kv
            .sorted_set_add(&history_key(session_id), step.timestamp as f64, &serialized)
            .await?;

        let total = self
            .kv
            .sorted_set_cardinality(&history_key(session_id))
            .await?;
        self.kv
            .hash_write(
                &state_key(session_id),
                &[
                    ("last_active_time", now_millis().to_string()),
                    ("total_steps", total.to_string()),
                ],
                Some(SESSION_TTL),
            )
            .await?;
        self.kv.expire(&steps_key(session_id), SESSION_TTL).await?;
        self.kv
            .expire(&history_key(session_id), SESSION_TTL)
            .await?;
        Ok(())
    }

    /// The complete history, ascending by completion time, fully
    /// materialized because recovery needs all of it up front.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Step>> {
        let members = self
            .kv
            .sorted_set_range_by_score(
                &history_key(session_id),
                f64::NEG_INFINITY,
                f64::INFINITY,
            )
            .await?;
        members
            .iter()
            .map(|m| serde_json::from_str(m).map_err(CoreError::from))
            .collect()
    }

    /// The bounded most-recent list, newest first.
    pub async fn recent_steps(&self, session_id: &str) -> Result<Vec<Step>> {
        let members = self
            .kv
            .list_range(&steps_key(session_id), 0, -1)
            .await?;
        members
            .iter()
            .map(|m| serde_json::from_str(m).map_err(CoreError::from))
            .collect()
    }

    /// The typed session state, or `None` when the session is unknown.
    pub async fn state(&self, session_id: &str) -> Result<Option<SessionState>> {
        let fields = self.kv.hash_read_all(&state_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        SessionState::from_hash(&fields).map(Some)
    }

    /// Rewrite the state hash from a snapshot. Keeps a terminal diagnosis
    /// visible after cleanup until the TTL expires.
    pub async fn restore_state(&self, session_id: &str, state: &SessionState) -> Result<()> {
        let mut fields = vec![
            ("status", state.status.as_str().to_string()),
            ("last_active_time", state.last_active_time.to_string()),
            ("total_steps", state.total_steps.to_string()),
        ];
        if let Some(error) = &state.error {
            fields.push(("error", error.clone()));
        }
        if let Some(reason) = &state.termination_reason {
            fields.push(("termination_reason", reason.clone()));
        }
        if let Some(job_id) = &state.failed_job_id {
            fields.push(("failed_job_id", job_id.clone()));
        }
        self.kv
            .hash_write(&state_key(session_id), &fields, Some(SESSION_TTL))
            .await?;
        Ok(())
    }

    /// Current gateway transport id, when one is bound.
    pub async fn connection_id(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.kv.get(&connection_key(session_id)).await?)
    }

    /// True when the session status is `active`.
    pub async fn is_active(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .state(session_id)
            .await?
            .map(|s| s.status == SessionStatus::Active)
            .unwrap_or(false))
    }

    /// Ids of every session with persisted state. Eventually consistent:
    /// keys may expire mid-scan.
    pub async fn list_active(&self) -> Result<Vec<String>> {
        let keys = self.kv.scan_keys(STATE_KEY_PATTERN).await?;
        Ok(keys
            .iter()
            .filter_map(|k| session_from_state_key(k))
            .map(str::to_string)
            .collect())
    }

    /// Delete all five namespaced keys for a session.
    pub async fn cleanup(&self, session_id: &str) -> Result<()> {
        self.kv
            .delete_many(&[
                lock_key(session_id),
                connection_key(session_id),
                steps_key(session_id),
                history_key(session_id),
                state_key(session_id),
            ])
            .await?;
        debug!(session_id, "session records deleted");
        Ok(())
    }
}
