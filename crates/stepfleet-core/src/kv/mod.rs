// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KV store interfaces and backends.
//!
//! This module defines the typed wrapper over the shared key-value +
//! pub/sub store and its backend implementations. All persistent state
//! lives behind [`KvStore`]; hosts are stateless caches.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::KvError;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvMessage {
    /// The concrete channel the message was published on.
    pub channel: String,
    /// The message payload.
    pub payload: String,
}

/// An open subscription: an async stream of [`KvMessage`]s.
///
/// Backends re-install subscriptions after a reconnect; a `None` from
/// [`next`](Self::next) means the subscription is permanently closed.
pub struct KvSubscription {
    rx: mpsc::UnboundedReceiver<KvMessage>,
}

impl KvSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<KvMessage>) -> Self {
        Self { rx }
    }

    /// Receive the next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<KvMessage> {
        self.rx.recv().await
    }
}

/// Typed wrapper over the shared store: keys, atomic ops, pub/sub.
///
/// Commands issued while the backend is disconnected fail with
/// [`KvError::Transient`] once the backend's bounded retries are exhausted.
#[allow(missing_docs)]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Atomic set-if-absent with TTL. Returns true when the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// Atomic compare-and-delete. Returns true when the key held `expected`
    /// and was deleted. The naive read-then-delete two-step is forbidden:
    /// it races with TTL expiry and can delete a successor's value.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    /// Atomic compare-and-refresh. Returns true when the key held `expected`
    /// and its TTL was re-armed. The naive read-then-write two-step is
    /// forbidden for the same reason as in [`compare_and_delete`]: a stale
    /// write after expiry would resurrect a value a successor now owns.
    ///
    /// [`compare_and_delete`]: KvStore::compare_and_delete
    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// Refresh the TTL on an existing key. No-op when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;

    async fn hash_write(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    async fn hash_read_all(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn list_pop_head(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Remove every occurrence of `value` from the list.
    async fn list_remove(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Trim the list to the inclusive index range `[start, stop]`.
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError>;

    async fn list_len(&self, key: &str) -> Result<u64, KvError>;

    async fn list_range(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<String>, KvError>;

    async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> Result<(), KvError>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError>;

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64, KvError>;

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), KvError>;

    /// All keys matching a glob pattern. Backends scan with a cursor and a
    /// bounded batch size; callers must tolerate eventually-consistent
    /// results (keys expiring mid-scan).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError>;

    /// Subscribe to an exact channel or a `*` glob pattern.
    async fn subscribe(&self, channel_or_pattern: &str) -> Result<KvSubscription, KvError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), KvError>;
}

/// Glob match supporting `*` wildcards, the subset Redis patterns use here.
pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
            }
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}
