// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stepfleet-core E2E tests.
//!
//! Provides a TestContext over the in-memory KV backend, a scripted
//! executor with injectable failures, and a recording notifier.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use stepfleet_core::executor::{CompletionNotifier, ExecutorError, StepExecutor};
use stepfleet_core::kv::{KvStore, KvSubscription, MemoryKv};
use stepfleet_core::manager::{WorkerManager, WorkerManagerConfig};
use stepfleet_core::queue::QueueService;
use stepfleet_core::registry::SessionRegistry;
use stepfleet_core::runtime::{HostRuntime, HostRuntimeBuilder};
use stepfleet_core::session::{
    control_channel, SessionStatus, Step, StepPayload, NEW_SESSIONS_CHANNEL,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const POLL: Duration = Duration::from_millis(20);

/// Test context sharing one in-memory store across hosts under test.
pub struct TestContext {
    pub kv: Arc<MemoryKv>,
    pub registry: SessionRegistry,
    pub queues: QueueService,
    pub executor: Arc<ScriptedExecutor>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestContext {
    pub fn new() -> Self {
        let kv = Arc::new(MemoryKv::new());
        let store: Arc<dyn KvStore> = kv.clone();
        Self {
            kv,
            registry: SessionRegistry::new(store.clone()),
            queues: QueueService::new(store),
            executor: Arc::new(ScriptedExecutor::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    /// Start a host runtime with test-friendly intervals.
    pub async fn start_host(&self, max_workers: usize) -> HostRuntime {
        HostRuntimeBuilder::new()
            .kv(self.store())
            .executor(self.executor.clone())
            .notifier(self.notifier.clone())
            .config(WorkerManagerConfig {
                max_workers,
                poll_interval: Duration::from_millis(20),
                renew_interval: Duration::from_millis(50),
            })
            .build()
            .expect("build host runtime")
            .start()
            .await
            .expect("start host runtime")
    }

    /// What the gateway does on client connect, minus the announcement.
    pub async fn connect_session(&self, session_id: &str, connection_id: &str) {
        self.registry
            .create_or_touch(session_id, connection_id)
            .await
            .expect("register session");
    }

    /// Publish a new-session announcement.
    pub async fn announce(&self, session_id: &str) {
        self.kv
            .publish(NEW_SESSIONS_CHANNEL, session_id)
            .await
            .expect("announce session");
    }

    /// Publish a STOP on a session's control channel.
    pub async fn publish_stop(&self, session_id: &str) {
        self.kv
            .publish(&control_channel(session_id), "STOP")
            .await
            .expect("publish stop");
    }

    /// Subscribe to a session's control channel.
    pub async fn subscribe_control(&self, session_id: &str) -> KvSubscription {
        self.kv
            .subscribe(&control_channel(session_id))
            .await
            .expect("subscribe control channel")
    }

    /// Enqueue a step the way the gateway does.
    pub async fn enqueue(&self, session_id: &str, action: &str, data: serde_json::Value) -> String {
        self.queues
            .enqueue(
                session_id,
                &StepPayload {
                    action: action.to_string(),
                    data,
                },
                Default::default(),
            )
            .await
            .expect("enqueue step")
    }
}

pub async fn wait_for_history_len(registry: &SessionRegistry, session_id: &str, len: usize) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let history = registry.history(session_id).await.expect("read history");
        if history.len() == len {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timeout waiting for history length {len} on '{session_id}', got {}",
                history.len()
            );
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_for_status(
    registry: &SessionRegistry,
    session_id: &str,
    expected: SessionStatus,
) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let status = registry
            .state(session_id)
            .await
            .expect("read state")
            .map(|s| s.status);
        if status == Some(expected) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timeout waiting for status {expected} on '{session_id}', got {status:?}");
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_for_worker_count(manager: &Arc<WorkerManager>, expected: usize) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let count = manager.worker_count().await;
        if count == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timeout waiting for worker count {expected}, got {count}");
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_for_tracked(manager: &Arc<WorkerManager>, session_id: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if manager
            .tracked_sessions()
            .await
            .iter()
            .any(|id| id == session_id)
        {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timeout waiting for '{session_id}' to be tracked");
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Executor that records every call and fails on demand.
#[derive(Default)]
pub struct ScriptedExecutor {
    state: Mutex<ExecutorState>,
}

#[derive(Default)]
struct ExecutorState {
    executions: Vec<(String, String)>,
    replays: Vec<(String, String)>,
    failures: HashMap<String, u32>,
}

impl ScriptedExecutor {
    fn lock(&self) -> std::sync::MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `times` executions of `action` fail.
    pub fn fail_action(&self, action: &str, times: u32) {
        self.lock().failures.insert(action.to_string(), times);
    }

    /// Actions executed for a session, in order.
    pub fn executed_actions(&self, session_id: &str) -> Vec<String> {
        self.lock()
            .executions
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, action)| action.clone())
            .collect()
    }

    /// Actions replayed for a session, in order.
    pub fn replayed_actions(&self, session_id: &str) -> Vec<String> {
        self.lock()
            .replays
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, action)| action.clone())
            .collect()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        session_id: &str,
        step: &StepPayload,
    ) -> Result<serde_json::Value, ExecutorError> {
        let mut state = self.lock();
        state
            .executions
            .push((session_id.to_string(), step.action.clone()));
        if let Some(remaining) = state.failures.get_mut(&step.action) {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(1);
                return Err(ExecutorError::new(format!(
                    "scripted failure for '{}'",
                    step.action
                )));
            }
        }
        Ok(json!({"ok": true}))
    }

    async fn replay(&self, session_id: &str, step: &Step) -> Result<(), ExecutorError> {
        self.lock()
            .replays
            .push((session_id.to_string(), step.action.clone()));
        Ok(())
    }
}

/// A completion delivered to the gateway port.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub connection_id: String,
    pub session_id: String,
    pub step: Step,
}

/// Notifier that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Delivered>>,
}

impl RecordingNotifier {
    pub fn deliveries(&self) -> Vec<Delivered> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn step_completed(&self, connection_id: &str, session_id: &str, step: &Step) {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Delivered {
                connection_id: connection_id.to_string(),
                session_id: session_id.to_string(),
                step: step.clone(),
            });
    }
}
