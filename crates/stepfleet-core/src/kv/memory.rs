// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory KV backend.
//!
//! A complete implementation of [`KvStore`] over process-local maps, with
//! lazy TTL expiry and broadcast pub/sub. Used by tests and by local
//! development setups that run without a shared store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{glob_match, KvMessage, KvStore, KvSubscription};
use crate::error::KvError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    // kept sorted by (score, member)
    Zset(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<KvMessage>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    subscribers: Vec<Subscriber>,
}

/// In-memory [`KvStore`] backend.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn expired(entry: &Entry) -> bool {
    entry
        .expires_at
        .map(|at| at <= Instant::now())
        .unwrap_or(false)
}

fn live<'a>(inner: &'a mut Inner, key: &str) -> Option<&'a mut Entry> {
    if inner.entries.get(key).map(expired).unwrap_or(false) {
        inner.entries.remove(key);
    }
    inner.entries.get_mut(key)
}

fn wrong_type(key: &str) -> KvError {
    KvError::Backend(format!("WRONGTYPE operation against key '{key}'"))
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

impl Inner {
    fn list_mut<'a>(&'a mut self, key: &str) -> Result<&'a mut VecDeque<String>, KvError> {
        if self.entries.get(key).map(expired).unwrap_or(false) {
            self.entries.remove(key);
        }
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &e.value) {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut inner = self.lock();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut inner = self.lock();
        if live(&mut inner, key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: deadline(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut inner = self.lock();
        let matches = matches!(
            live(&mut inner, key).map(|e| &e.value),
            Some(Value::Str(s)) if s == expected
        );
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key) {
            Some(entry) => {
                let Value::Str(current) = &entry.value else {
                    return Err(wrong_type(key));
                };
                if current != expected {
                    return Ok(false);
                }
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut inner = self.lock();
        if let Some(entry) = live(&mut inner, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hash_write(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &mut e.value) {
            Some(Value::Hash(hash)) => {
                for (field, value) in fields {
                    hash.insert((*field).to_string(), value.clone());
                }
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                let mut hash = HashMap::new();
                for (field, value) in fields {
                    hash.insert((*field).to_string(), value.clone());
                }
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(hash),
                        expires_at: None,
                    },
                );
            }
        }
        if let Some(ttl) = ttl {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn hash_read_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        inner.list_mut(key)?.push_front(value.to_string());
        Ok(())
    }

    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        inner.list_mut(key)?.push_back(value.to_string());
        Ok(())
    }

    async fn list_pop_head(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &mut e.value) {
            Some(Value::List(list)) => {
                let popped = list.pop_front();
                if list.is_empty() {
                    inner.entries.remove(key);
                }
                Ok(popped)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &mut e.value) {
            Some(Value::List(list)) => {
                list.retain(|v| v != value);
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(()),
        }
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &mut e.value) {
            Some(Value::List(list)) => {
                let len = list.len() as i64;
                let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
                let start = norm(start);
                let stop = norm(stop).min(len - 1);
                if start > stop {
                    list.clear();
                } else {
                    let kept: VecDeque<String> = list
                        .iter()
                        .skip(start as usize)
                        .take((stop - start + 1) as usize)
                        .cloned()
                        .collect();
                    *list = kept;
                }
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(()),
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &e.value) {
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &e.value) {
            Some(Value::List(list)) => {
                let len = list.len() as i64;
                let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
                let start = norm(start);
                let stop = norm(stop).min(len - 1);
                if start > stop || len == 0 {
                    return Ok(Vec::new());
                }
                Ok(list
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &mut e.value) {
            Some(Value::Zset(set)) => {
                set.retain(|(_, m)| m != member);
                let at = set
                    .partition_point(|(s, m)| (*s, m.as_str()) <= (score, member));
                set.insert(at, (score, member.to_string()));
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Zset(vec![(score, member.to_string())]),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &e.value) {
            Some(Value::Zset(set)) => Ok(set
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .map(|(_, member)| member.clone())
                .collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64, KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &e.value) {
            Some(Value::Zset(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        match live(&mut inner, key).map(|e| &mut e.value) {
            Some(Value::Zset(set)) => {
                set.retain(|(_, m)| m != member);
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(()),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut inner = self.lock();
        inner.entries.retain(|_, entry| !expired(entry));
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| {
            if !glob_match(&sub.pattern, channel) {
                return true;
            }
            sub.tx
                .send(KvMessage {
                    channel: channel.to_string(),
                    payload: message.to_string(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, channel_or_pattern: &str) -> Result<KvSubscription, KvError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.subscribers.push(Subscriber {
            pattern: channel_or_pattern.to_string(),
            tx,
        });
        Ok(KvSubscription::new(rx))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), KvError> {
        let mut inner = self.lock();
        for key in keys {
            inner.entries.remove(key);
        }
        Ok(())
    }
}
