// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis KV backend.
//!
//! Two independent connections are maintained: a command connection (an
//! auto-reconnecting [`ConnectionManager`]) and a dedicated subscription
//! connection driven by a background task. Publishing uses the command
//! connection. After a reconnect the background task re-installs every
//! registered subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{glob_match, KvMessage, KvStore, KvSubscription};
use crate::error::KvError;

/// Atomic compare-and-delete. A plain GET-then-DEL races with TTL expiry
/// and could delete a successor's value.
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end"#;

/// Atomic compare-and-refresh. A plain GET-then-SET races with TTL expiry
/// and could overwrite a lease a successor acquired in between.
const COMPARE_AND_REFRESH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return 1
else
    return 0
end"#;

const SCAN_BATCH: usize = 100;
const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_CEIL: Duration = Duration::from_secs(30);

type Subscribers = Vec<(String, mpsc::UnboundedSender<KvMessage>)>;

/// Redis-backed [`KvStore`].
pub struct RedisKv {
    conn: ConnectionManager,
    cad_script: redis::Script,
    car_script: redis::Script,
    subscribers: Arc<Mutex<Subscribers>>,
    install_tx: mpsc::UnboundedSender<String>,
}

impl RedisKv {
    /// Connect to Redis and spawn the subscription task.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(kv_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(kv_err)?;

        let subscribers: Arc<Mutex<Subscribers>> = Arc::new(Mutex::new(Vec::new()));
        let (install_tx, install_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriptions(client, subscribers.clone(), install_rx));

        Ok(Self {
            conn,
            cad_script: redis::Script::new(COMPARE_AND_DELETE),
            car_script: redis::Script::new(COMPARE_AND_REFRESH),
            subscribers,
            install_tx,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn kv_err(err: redis::RedisError) -> KvError {
    if err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
    {
        KvError::Transient(err.to_string())
    } else {
        KvError::Backend(err.to_string())
    }
}

fn fmt_score(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Drive the subscription connection: connect, install every registered
/// pattern, forward messages, reconnect with bounded backoff on loss.
async fn run_subscriptions(
    client: redis::Client,
    subscribers: Arc<Mutex<Subscribers>>,
    mut install_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut backoff = RECONNECT_BACKOFF_FLOOR;
    loop {
        #[allow(deprecated)]
        let conn = match client.get_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "subscription connection failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEIL);
                continue;
            }
        };
        let mut pubsub = conn.into_pubsub();

        let patterns: Vec<String> = {
            let subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subs.iter().map(|(pattern, _)| pattern.clone()).collect()
        };
        let mut install_failed = false;
        for pattern in &patterns {
            if let Err(e) = pubsub.psubscribe(pattern).await {
                warn!(pattern = %pattern, error = %e, "re-subscribe failed");
                install_failed = true;
                break;
            }
        }
        if install_failed {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEIL);
            continue;
        }
        backoff = RECONNECT_BACKOFF_FLOOR;
        debug!(patterns = patterns.len(), "subscription connection established");

        loop {
            enum Event {
                Install(Option<String>),
                Message(Option<(String, Result<String, redis::RedisError>)>),
            }

            let event = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    cmd = install_rx.recv() => Event::Install(cmd),
                    msg = stream.next() => Event::Message(msg.map(|m| {
                        (m.get_channel_name().to_string(), m.get_payload::<String>())
                    })),
                }
            };

            match event {
                // The owning RedisKv was dropped.
                Event::Install(None) => return,
                Event::Install(Some(pattern)) => {
                    if let Err(e) = pubsub.psubscribe(&pattern).await {
                        warn!(pattern = %pattern, error = %e, "psubscribe failed, reconnecting");
                        break;
                    }
                }
                Event::Message(None) => {
                    warn!("subscription connection lost, reconnecting");
                    break;
                }
                Event::Message(Some((channel, payload))) => {
                    let payload = match payload {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "undecodable message dropped");
                            continue;
                        }
                    };
                    let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
                    subs.retain(|(pattern, tx)| {
                        if !glob_match(pattern, &channel) {
                            return true;
                        }
                        tx.send(KvMessage {
                            channel: channel.clone(),
                            payload: payload.clone(),
                        })
                        .is_ok()
                    });
                }
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await.map_err(kv_err)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(set.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .cad_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(deleted == 1)
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let refreshed: i64 = self
            .car_script
            .key(key)
            .arg(expected)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(refreshed == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn hash_write(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        cmd.query_async::<_, i64>(&mut conn).await.map_err(kv_err)?;
        if let Some(ttl) = ttl {
            self.expire(key, ttl).await?;
        }
        Ok(())
    }

    async fn hash_read_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.conn();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn list_pop_head(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn list_len(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(fmt_score(min))
            .arg(fmt_score(max))
            .query_async(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(kv_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel_or_pattern: &str) -> Result<KvSubscription, KvError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut subs = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subs.push((channel_or_pattern.to_string(), tx));
        }
        self.install_tx
            .send(channel_or_pattern.to_string())
            .map_err(|_| KvError::SubscriptionClosed)?;
        Ok(KvSubscription::new(rx))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<_, i64>(&mut conn).await.map_err(kv_err)?;
        Ok(())
    }
}
