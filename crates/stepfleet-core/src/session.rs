// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session vocabulary shared across the core: statuses, steps, state records,
//! and the pub/sub channel names.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Announcement bus. Payload is a bare session id.
pub const NEW_SESSIONS_CHANNEL: &str = "new-sessions-channel";

/// The only control command currently defined. Other payloads are reserved.
pub const STOP_COMMAND: &str = "STOP";

/// Per-session control channel name.
pub fn control_channel(session_id: &str) -> String {
    format!("session-control:{session_id}")
}

/// Pattern matching every per-session control channel.
pub const CONTROL_CHANNEL_PATTERN: &str = "session-control:*";

/// Extract the session id from a control channel name.
pub fn session_from_control_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("session-control:")
}

/// Millisecond epoch timestamp, the time unit used throughout the KV records.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Session lifecycle status.
///
/// Serialized to lowercase wire strings in the `session:state:<id>` hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Client connected; no worker has claimed the session yet.
    Connected,
    /// A worker holds the lease and is draining the queue.
    Active,
    /// Queue dispatch halted; in-flight work completes normally.
    Paused,
    /// A new owner is replaying persisted history.
    Recovering,
    /// The last step execution failed; the queue is retrying.
    Error,
    /// A job exhausted its retries (poison pill).
    Failed,
    /// Stopped for good, by disconnect or idle timeout.
    Terminated,
}

impl SessionStatus {
    /// Wire string stored in the state hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Recovering => "recovering",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// True for statuses no worker should resume from.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Self::Connected),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "recovering" => Ok(Self::Recovering),
            "error" => Ok(Self::Error),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(CoreError::Protocol(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

/// A step as submitted by the client: an opaque action tag plus payload.
///
/// This is what travels through the queue. It becomes a [`Step`] once the
/// executor has run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    /// Opaque action tag (e.g. `navigate`, `click`).
    pub action: String,
    /// Opaque action payload.
    pub data: serde_json::Value,
}

/// A completed step as recorded in session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Job id of the execution that produced this record.
    pub id: String,
    /// Opaque action tag.
    pub action: String,
    /// Opaque action payload.
    pub data: serde_json::Value,
    /// Completion time, millisecond epoch. Sort key in history.
    pub timestamp: i64,
}

/// Typed view of the `session:state:<id>` hash.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Millisecond epoch of the last completion or status change.
    pub last_active_time: i64,
    /// Monotone count of completed steps; equals the history cardinality.
    pub total_steps: u64,
    /// Last execution error or recovery progress message.
    pub error: Option<String>,
    /// Why the session was terminated, when it was.
    pub termination_reason: Option<String>,
    /// Job id that exhausted its retries, when one did.
    pub failed_job_id: Option<String>,
}

impl SessionState {
    /// Parse the raw hash fields into a typed state.
    pub fn from_hash(fields: &HashMap<String, String>) -> Result<Self, CoreError> {
        let status = fields
            .get("status")
            .ok_or_else(|| CoreError::Protocol("state hash missing 'status'".into()))?
            .parse()?;
        let last_active_time = fields
            .get("last_active_time")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let total_steps = fields
            .get("total_steps")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let non_empty = |k: &str| fields.get(k).filter(|v| !v.is_empty()).cloned();
        Ok(Self {
            status,
            last_active_time,
            total_steps,
            error: non_empty("error"),
            termination_reason: non_empty("termination_reason"),
            failed_job_id: non_empty("failed_job_id"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_strings() {
        for status in [
            SessionStatus::Connected,
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Recovering,
            SessionStatus::Error,
            SessionStatus::Failed,
            SessionStatus::Terminated,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_a_protocol_error() {
        assert!("zombie".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Error.is_terminal());
    }

    #[test]
    fn control_channel_names() {
        assert_eq!(control_channel("abc"), "session-control:abc");
        assert_eq!(
            session_from_control_channel("session-control:abc"),
            Some("abc")
        );
        assert_eq!(session_from_control_channel("new-sessions-channel"), None);
    }

    #[test]
    fn state_parses_sparse_hash() {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "terminated".to_string());
        fields.insert("termination_reason".to_string(), "idle_timeout".to_string());
        let state = SessionState::from_hash(&fields).unwrap();
        assert_eq!(state.status, SessionStatus::Terminated);
        assert_eq!(state.termination_reason.as_deref(), Some("idle_timeout"));
        assert_eq!(state.total_steps, 0);
        assert!(state.error.is_none());
    }

    #[test]
    fn state_requires_status() {
        assert!(SessionState::from_hash(&HashMap::new()).is_err());
    }
}
