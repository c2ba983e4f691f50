// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor and notification ports.
//!
//! The core treats step execution as opaque: it calls [`StepExecutor`] and
//! persists the outcome. The gateway-facing completion notification is
//! likewise a port; routing a notification to a live client socket is the
//! gateway's concern, possibly on another host.

use async_trait::async_trait;
use tracing::debug;

use crate::session::{Step, StepPayload};

/// Step execution failure. The queue applies retry/backoff to these.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ExecutorError {
    /// Human-readable failure description.
    pub message: String,
}

impl ExecutorError {
    /// Create an error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes steps on behalf of a session.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute a step for real. Called exactly once per dispatch attempt.
    async fn execute(
        &self,
        session_id: &str,
        step: &StepPayload,
    ) -> Result<serde_json::Value, ExecutorError>;

    /// Re-apply an already-completed step to rebuild in-process state after
    /// a claim. Must be side-effect-free from the client's perspective: no
    /// completion events are emitted for replayed steps. Executors must
    /// tolerate duplicate replay of already-applied steps.
    async fn replay(&self, session_id: &str, step: &Step) -> Result<(), ExecutorError>;
}

/// Delivers step-completion notifications toward the gateway.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    /// A step completed for the session bound to `connection_id`.
    async fn step_completed(&self, connection_id: &str, session_id: &str, step: &Step);
}

/// Notifier that only logs. Installed when no gateway relay is wired up.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn step_completed(&self, connection_id: &str, session_id: &str, step: &Step) {
        debug!(
            connection_id,
            session_id,
            step_id = %step.id,
            action = %step.action,
            "step completed"
        );
    }
}
