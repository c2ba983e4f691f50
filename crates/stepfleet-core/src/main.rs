// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepfleet host binary.
//!
//! One replaceable container instance: connects to the shared KV store,
//! subscribes to session announcements, and claims sessions up to
//! `MAX_WORKERS_PER_CONTAINER`.
//!
//! Note: the client-facing socket gateway and the step executor are
//! external. This binary wires a no-op executor; deployments embed the
//! runtime and supply their own.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use stepfleet_core::config::Config;
use stepfleet_core::executor::{ExecutorError, StepExecutor};
use stepfleet_core::kv::RedisKv;
use stepfleet_core::manager::WorkerManagerConfig;
use stepfleet_core::runtime::HostRuntime;
use stepfleet_core::session::{Step, StepPayload};

/// Placeholder executor: acknowledges every step without side effects.
struct NoopExecutor;

#[async_trait]
impl StepExecutor for NoopExecutor {
    async fn execute(
        &self,
        session_id: &str,
        step: &StepPayload,
    ) -> Result<serde_json::Value, ExecutorError> {
        info!(session_id, action = %step.action, "executing step (noop)");
        Ok(serde_json::Value::Null)
    }

    async fn replay(&self, session_id: &str, step: &Step) -> Result<(), ExecutorError> {
        info!(session_id, action = %step.action, "replaying step (noop)");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stepfleet_core=info".parse()?),
        )
        .init();

    info!("Starting Stepfleet host");

    let config = Config::from_env()?;
    info!(
        max_workers = config.max_workers,
        "Configuration loaded"
    );

    info!("Connecting to KV store...");
    let kv = Arc::new(RedisKv::connect(&config.redis_url).await?);
    info!("KV store connection established");

    let runtime = HostRuntime::builder()
        .kv(kv)
        .executor(Arc::new(NoopExecutor))
        .config(WorkerManagerConfig {
            max_workers: config.max_workers,
            ..WorkerManagerConfig::default()
        })
        .build()?
        .start()
        .await?;

    info!(
        manager_id = %runtime.manager().manager_id(),
        "Stepfleet host initialized successfully"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
