// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL assembled from `REDIS_HOST`/`REDIS_PORT`/`REDIS_PASSWORD`.
    pub redis_url: String,
    /// Maximum sessions this host will claim concurrently.
    pub max_workers: usize,
    /// Idle timeout before the reaper terminates a session, in milliseconds.
    pub idle_timeout_ms: i64,
    /// How often the reaper sweeps, in milliseconds.
    pub reaper_poll_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `REDIS_HOST`: KV store hostname
    ///
    /// Optional (with defaults):
    /// - `REDIS_PORT`: KV store port (default: 6379)
    /// - `REDIS_PASSWORD`: KV store password (default: none)
    /// - `MAX_WORKERS_PER_CONTAINER`: claim capacity (default: 5)
    /// - `IDLE_TIMEOUT_MS`: idle timeout (default: 1800000)
    /// - `REAPER_POLL_INTERVAL_MS`: sweep interval (default: 300000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let host =
            std::env::var("REDIS_HOST").map_err(|_| ConfigError::Missing("REDIS_HOST"))?;

        let port: u16 = std::env::var("REDIS_PORT")
            .unwrap_or_else(|_| "6379".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("REDIS_PORT", "must be a valid port number"))?;

        let redis_url = match std::env::var("REDIS_PASSWORD") {
            Ok(password) if !password.is_empty() => {
                format!("redis://:{password}@{host}:{port}")
            }
            _ => format!("redis://{host}:{port}"),
        };

        let max_workers: usize = std::env::var("MAX_WORKERS_PER_CONTAINER")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("MAX_WORKERS_PER_CONTAINER", "must be a positive integer")
            })?;

        let idle_timeout_ms: i64 = std::env::var("IDLE_TIMEOUT_MS")
            .unwrap_or_else(|_| "1800000".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("IDLE_TIMEOUT_MS", "must be milliseconds"))?;

        let reaper_poll_interval_ms: u64 = std::env::var("REAPER_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "300000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("REAPER_POLL_INTERVAL_MS", "must be milliseconds")
            })?;

        Ok(Self {
            redis_url,
            max_workers,
            idle_timeout_ms,
            reaper_poll_interval_ms,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
