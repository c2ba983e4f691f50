// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepfleet idle-reaper binary.
//!
//! Runs the periodic idle-session sweep as its own scheduled job,
//! separate from the worker hosts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use stepfleet_core::config::Config;
use stepfleet_core::kv::RedisKv;
use stepfleet_reaper::{IdleReaper, IdleReaperConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stepfleet_reaper=info".parse()?),
        )
        .init();

    info!("Starting Stepfleet reaper");

    let config = Config::from_env()?;
    info!(
        idle_timeout_ms = config.idle_timeout_ms,
        poll_interval_ms = config.reaper_poll_interval_ms,
        "Configuration loaded"
    );

    info!("Connecting to KV store...");
    let kv = Arc::new(RedisKv::connect(&config.redis_url).await?);
    info!("KV store connection established");

    let reaper = IdleReaper::new(
        kv,
        IdleReaperConfig {
            poll_interval: Duration::from_millis(config.reaper_poll_interval_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms.max(0) as u64),
        },
    );
    let shutdown = reaper.shutdown_handle();

    let reaper_handle = tokio::spawn(async move { reaper.run().await });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.notify_one();
    reaper_handle.await?;
    info!("Shutdown complete");

    Ok(())
}
