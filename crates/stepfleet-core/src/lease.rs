// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session leases: the exclusive, TTL-bounded right of one manager to
//! drive a session's queue.
//!
//! Acquisition is linearized by the store's set-if-absent; renewal and
//! release go through the atomic compare-and-refresh and
//! compare-and-delete so an expired owner can never extend or free a
//! successor's lease.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::kv::KvStore;

/// Lease TTL. A manager that stays silent longer than this relinquishes
/// its sessions implicitly.
pub const LEASE_TTL: Duration = Duration::from_secs(30);

/// KV key holding a session's lease.
pub fn lock_key(session_id: &str) -> String {
    format!("session:lock:{session_id}")
}

/// Lease operations bound to one manager identity.
#[derive(Clone)]
pub struct SessionLease {
    kv: Arc<dyn KvStore>,
    manager_id: String,
    ttl: Duration,
}

impl SessionLease {
    /// Create a lease handle for the given manager id.
    pub fn new(kv: Arc<dyn KvStore>, manager_id: String) -> Self {
        Self {
            kv,
            manager_id,
            ttl: LEASE_TTL,
        }
    }

    /// Override the TTL. Tests shorten it to exercise expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The owning manager id this handle acquires and releases under.
    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    /// Try to acquire the lease. Returns false when another manager holds it.
    pub async fn acquire(&self, session_id: &str) -> Result<bool> {
        let acquired = self
            .kv
            .set_if_absent(&lock_key(session_id), &self.manager_id, self.ttl)
            .await?;
        debug!(session_id, manager_id = %self.manager_id, acquired, "lease acquire");
        Ok(acquired)
    }

    /// Renew the lease by re-arming the TTL on the same value, via the
    /// atomic compare-and-refresh.
    ///
    /// Fails with [`CoreError::LeaseLost`] when the key expired or another
    /// manager now holds it; the caller must relinquish its worker without
    /// touching shared state.
    pub async fn renew(&self, session_id: &str) -> Result<()> {
        let key = lock_key(session_id);
        if self
            .kv
            .compare_and_refresh(&key, &self.manager_id, self.ttl)
            .await?
        {
            return Ok(());
        }
        // read the current holder for the diagnostic only
        let holder = self.kv.get(&key).await?;
        Err(CoreError::LeaseLost {
            session_id: session_id.to_string(),
            holder,
        })
    }

    /// True when this manager currently holds the lease.
    pub async fn is_owned(&self, session_id: &str) -> Result<bool> {
        Ok(self.kv.get(&lock_key(session_id)).await?.as_deref() == Some(self.manager_id.as_str()))
    }

    /// Release the lease via compare-and-delete.
    ///
    /// Returns false (a no-op) when the TTL already expired or another
    /// manager holds the lease.
    pub async fn release(&self, session_id: &str) -> Result<bool> {
        let released = self
            .kv
            .compare_and_delete(&lock_key(session_id), &self.manager_id)
            .await?;
        debug!(session_id, manager_id = %self.manager_id, released, "lease release");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn lease(kv: &Arc<MemoryKv>, id: &str) -> SessionLease {
        let kv: Arc<dyn KvStore> = kv.clone();
        SessionLease::new(kv, id.to_string())
    }

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let kv = Arc::new(MemoryKv::new());
        let a = lease(&kv, "manager-a");
        let b = lease(&kv, "manager-b");

        assert!(a.acquire("s1").await.unwrap());
        assert!(!b.acquire("s1").await.unwrap());
        assert!(a.is_owned("s1").await.unwrap());
        assert!(!b.is_owned("s1").await.unwrap());
    }

    #[tokio::test]
    async fn release_requires_ownership() {
        let kv = Arc::new(MemoryKv::new());
        let a = lease(&kv, "manager-a");
        let b = lease(&kv, "manager-b");

        assert!(a.acquire("s1").await.unwrap());
        // releasing a lease you do not own is a no-op
        assert!(!b.release("s1").await.unwrap());
        assert!(a.is_owned("s1").await.unwrap());
        assert!(a.release("s1").await.unwrap());
        // double release tolerates the already-gone key
        assert!(!a.release("s1").await.unwrap());
    }

    #[tokio::test]
    async fn renew_detects_takeover() {
        let kv = Arc::new(MemoryKv::new());
        let a = lease(&kv, "manager-a").with_ttl(Duration::from_millis(30));
        let b = lease(&kv, "manager-b");

        assert!(a.acquire("s1").await.unwrap());
        a.renew("s1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(b.acquire("s1").await.unwrap());

        let err = a.renew("s1").await.unwrap_err();
        match err {
            CoreError::LeaseLost { holder, .. } => {
                assert_eq!(holder.as_deref(), Some("manager-b"));
            }
            other => panic!("expected LeaseLost, got {other:?}"),
        }
        // the stale renew must not have overwritten the successor's lease
        assert!(b.is_owned("s1").await.unwrap());
        assert!(!a.is_owned("s1").await.unwrap());
    }

    #[tokio::test]
    async fn renew_after_expiry_reports_loss() {
        let kv = Arc::new(MemoryKv::new());
        let a = lease(&kv, "manager-a").with_ttl(Duration::from_millis(20));

        assert!(a.acquire("s1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = a.renew("s1").await.unwrap_err();
        assert!(matches!(err, CoreError::LeaseLost { holder: None, .. }));
    }
}
