//! Per-host write serialization
//!
//! A host's client list is rewritten wholesale on every change, so two
//! concurrent writers would lose one of the updates. Writers take a lease
//! per host name before their read-modify-write; dropping the lease
//! releases it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgPool, Postgres};

use crate::error::{BillingError, BillingResult};

/// Held for the duration of one panel read-modify-write.
pub enum HostLease {
    Local(tokio::sync::OwnedMutexGuard<()>),
    /// Local guard plus an open transaction holding
    /// `pg_advisory_xact_lock`; dropping it rolls back and unlocks.
    Advisory {
        _local: tokio::sync::OwnedMutexGuard<()>,
        _tx: sqlx::Transaction<'static, Postgres>,
    },
}

impl std::fmt::Debug for HostLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostLease::Local(_) => f.write_str("HostLease::Local"),
            HostLease::Advisory { .. } => f.write_str("HostLease::Advisory"),
        }
    }
}

#[async_trait]
pub trait HostWriteLock: Send + Sync {
    async fn acquire(&self, host_name: &str) -> BillingResult<HostLease>;
}

/// In-process mutex per host name.
#[derive(Default)]
pub struct LocalHostLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalHostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock(&self, host_name: &str) -> BillingResult<tokio::sync::OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| BillingError::Database("host lock table poisoned".into()))?;
            locks
                .entry(host_name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        Ok(mutex.lock_owned().await)
    }
}

#[async_trait]
impl HostWriteLock for LocalHostLocks {
    async fn acquire(&self, host_name: &str) -> BillingResult<HostLease> {
        Ok(HostLease::Local(self.lock(host_name).await?))
    }
}

/// Cross-process lock: the in-process mutex first, so one process holds at
/// most one pool connection per host, then a transaction-scoped advisory
/// lock keyed by the host name.
pub struct PgHostLocks {
    pool: PgPool,
    local: LocalHostLocks,
}

impl PgHostLocks {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            local: LocalHostLocks::new(),
        }
    }
}

#[async_trait]
impl HostWriteLock for PgHostLocks {
    async fn acquire(&self, host_name: &str) -> BillingResult<HostLease> {
        let local = self.local.lock(host_name).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(host_name)
            .execute(&mut *tx)
            .await?;
        tracing::debug!(host = %host_name, "Acquired host write lock");
        Ok(HostLease::Advisory {
            _local: local,
            _tx: tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_host_is_serialized() {
        let locks = Arc::new(LocalHostLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _lease = locks.acquire("nl-1").await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_hosts_do_not_block() {
        let locks = LocalHostLocks::new();
        let _a = locks.acquire("nl-1").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("de-1")).await;
        assert!(b.is_ok());
    }
}
