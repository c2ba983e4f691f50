// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable host runtime.
//!
//! [`HostRuntime`] wires the KV store, registry, queue service, and worker
//! manager together, installs the announcement and control subscriptions,
//! and runs the dispatch task that feeds them to the manager. Use it to
//! embed a session host into an existing tokio application instead of
//! running the standalone binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepfleet_core::kv::RedisKv;
//! use stepfleet_core::runtime::HostRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let kv = Arc::new(RedisKv::connect("redis://localhost:6379").await?);
//!     let runtime = HostRuntime::builder()
//!         .kv(kv)
//!         .executor(Arc::new(MyExecutor::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{CoreError, Result};
use crate::executor::{CompletionNotifier, LogNotifier, StepExecutor};
use crate::kv::{KvStore, KvSubscription};
use crate::manager::{WorkerManager, WorkerManagerConfig};
use crate::queue::QueueService;
use crate::session::{
    session_from_control_channel, CONTROL_CHANNEL_PATTERN, NEW_SESSIONS_CHANNEL,
};

/// Builder for a [`HostRuntime`].
pub struct HostRuntimeBuilder {
    kv: Option<Arc<dyn KvStore>>,
    executor: Option<Arc<dyn StepExecutor>>,
    notifier: Arc<dyn CompletionNotifier>,
    config: WorkerManagerConfig,
}

impl std::fmt::Debug for HostRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntimeBuilder")
            .field("kv", &self.kv.as_ref().map(|_| "..."))
            .field("executor", &self.executor.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for HostRuntimeBuilder {
    fn default() -> Self {
        Self {
            kv: None,
            executor: None,
            notifier: Arc::new(LogNotifier),
            config: WorkerManagerConfig::default(),
        }
    }
}

impl HostRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the KV store (required).
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Set the step executor (required).
    pub fn executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the completion notifier. Defaults to a logging no-op.
    pub fn notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Override the worker manager configuration.
    pub fn config(mut self, config: WorkerManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HostRuntimeConfig> {
        let kv = self
            .kv
            .ok_or_else(|| CoreError::Protocol("kv store is required".to_string()))?;
        let executor = self
            .executor
            .ok_or_else(|| CoreError::Protocol("executor is required".to_string()))?;
        Ok(HostRuntimeConfig {
            kv,
            executor,
            notifier: self.notifier,
            config: self.config,
        })
    }
}

/// A built-but-not-started host runtime.
pub struct HostRuntimeConfig {
    kv: Arc<dyn KvStore>,
    executor: Arc<dyn StepExecutor>,
    notifier: Arc<dyn CompletionNotifier>,
    config: WorkerManagerConfig,
}

impl HostRuntimeConfig {
    /// Install subscriptions and start the dispatch task.
    pub async fn start(self) -> Result<HostRuntime> {
        let queues = QueueService::new(self.kv.clone());
        let manager = Arc::new(WorkerManager::new(
            self.kv.clone(),
            queues,
            self.executor,
            self.notifier,
            self.config,
        ));

        let announcements = self.kv.subscribe(NEW_SESSIONS_CHANNEL).await?;
        let control = self.kv.subscribe(CONTROL_CHANNEL_PATTERN).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatch = tokio::spawn(run_dispatch(
            manager.clone(),
            announcements,
            control,
            shutdown_rx,
        ));

        info!(manager_id = %manager.manager_id(), "host runtime started");
        Ok(HostRuntime {
            manager,
            dispatch,
            shutdown_tx,
        })
    }
}

/// A running session host.
pub struct HostRuntime {
    manager: Arc<WorkerManager>,
    dispatch: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl HostRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }

    /// The worker manager driving this host.
    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    /// Check if the dispatch task is still running.
    pub fn is_running(&self) -> bool {
        !self.dispatch.is_finished()
    }

    /// Gracefully shut down: stop dispatch, then stop every worker so
    /// leases release cleanly and announcements resume quickly elsewhere.
    pub async fn shutdown(self) -> Result<()> {
        info!("host runtime shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.dispatch.await {
            error!(error = %e, "dispatch task join failed");
        }
        self.manager.shutdown().await;
        info!("host runtime shutdown complete");
        Ok(())
    }
}

/// Feed announcements and control messages to the manager. Each message is
/// handled on its own task so a long recovery replay cannot stall the bus.
async fn run_dispatch(
    manager: Arc<WorkerManager>,
    mut announcements: KvSubscription,
    mut control: KvSubscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            message = announcements.next() => {
                let Some(message) = message else {
                    warn!("announcement subscription closed");
                    break;
                };
                let session_id = message.payload.trim().to_string();
                if session_id.is_empty() {
                    continue;
                }
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.on_new_session(&session_id).await {
                        warn!(session_id = %session_id, error = %e, "announcement handling failed");
                    }
                });
            }

            message = control.next() => {
                let Some(message) = message else {
                    warn!("control subscription closed");
                    break;
                };
                let Some(session_id) = session_from_control_channel(&message.channel) else {
                    continue;
                };
                let session_id = session_id.to_string();
                let command = message.payload.clone();
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.on_session_control(&session_id, &command).await {
                        warn!(session_id = %session_id, error = %e, "control handling failed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorError;
    use crate::kv::MemoryKv;
    use crate::session::{Step, StepPayload};
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl StepExecutor for NoopExecutor {
        async fn execute(
            &self,
            _session_id: &str,
            _step: &StepPayload,
        ) -> std::result::Result<serde_json::Value, ExecutorError> {
            Ok(serde_json::Value::Null)
        }

        async fn replay(
            &self,
            _session_id: &str,
            _step: &Step,
        ) -> std::result::Result<(), ExecutorError> {
            Ok(())
        }
    }

    #[test]
    fn builder_requires_kv() {
        let result = HostRuntimeBuilder::new()
            .executor(Arc::new(NoopExecutor))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_requires_executor() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let result = HostRuntimeBuilder::new().kv(kv).build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_debug_hides_components() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let builder = HostRuntimeBuilder::new().kv(kv);
        let debug = format!("{builder:?}");
        assert!(debug.contains("HostRuntimeBuilder"));
        assert!(debug.contains("..."));
    }

    #[tokio::test]
    async fn runtime_starts_and_shuts_down() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let runtime = HostRuntime::builder()
            .kv(kv)
            .executor(Arc::new(NoopExecutor))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert_eq!(runtime.manager().worker_count().await, 0);
        runtime.shutdown().await.unwrap();
    }
}
