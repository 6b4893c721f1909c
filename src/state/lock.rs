//! Per-service locking for reconciliation passes.
//!
//! Every service id maps to one async mutex. A pass locks all the ids it
//! mutates, always in ascending order, so two passes over overlapping groups
//! cannot deadlock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CorralError, LockError, Result};

/// Information about a held lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Locked service ids, ascending.
    pub service_ids: Vec<i64>,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Guard over a set of service locks. Dropping it releases every lock.
#[derive(Debug)]
pub struct ServicesLock {
    info: LockInfo,
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// Hands out per-service locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
    holder: String,
    wait_timeout: Duration,
}

impl LockInfo {
    /// Creates lock info for the given holder and services.
    #[must_use]
    pub fn new(holder: &str, service_ids: Vec<i64>) -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            service_ids,
            acquired_at: Utc::now(),
        }
    }

    /// Seconds the lock has been held.
    #[must_use]
    pub fn held_secs(&self) -> i64 {
        (Utc::now() - self.acquired_at).num_seconds().max(0)
    }
}

impl ServicesLock {
    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Gets the lock ID.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.info.lock_id
    }
}

impl Drop for ServicesLock {
    fn drop(&mut self) {
        debug!(
            "Released lock {} on services {:?} after {}s",
            self.info.lock_id,
            self.info.service_ids,
            self.info.held_secs()
        );
    }
}

impl LockManager {
    /// Creates a lock manager that waits at most `wait_timeout` per request.
    #[must_use]
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            holder: generate_holder_id(),
            wait_timeout,
        }
    }

    /// Locks a single service.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the lock is not acquired in time.
    pub async fn lock_service(&self, service_id: i64) -> Result<ServicesLock> {
        self.lock_services([service_id]).await
    }

    /// Locks every given service, in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the locks are not all acquired in
    /// time. Locks taken before the timeout are released.
    pub async fn lock_services(&self, service_ids: impl IntoIterator<Item = i64>) -> Result<ServicesLock> {
        let ids: BTreeSet<i64> = service_ids.into_iter().collect();
        let ids: Vec<i64> = ids.into_iter().collect();

        let mut mutexes = Vec::with_capacity(ids.len());
        for id in &ids {
            mutexes.push(self.service_lock(*id).await);
        }

        let acquire = async move {
            let mut guards = Vec::with_capacity(mutexes.len());
            for mutex in mutexes {
                guards.push(mutex.lock_owned().await);
            }
            guards
        };

        let guards = tokio::time::timeout(self.wait_timeout, acquire)
            .await
            .map_err(|_| {
                CorralError::Lock(LockError::Timeout {
                    resource: format!("services {ids:?}"),
                    waited_secs: self.wait_timeout.as_secs(),
                })
            })?;

        let info = LockInfo::new(&self.holder, ids);
        debug!("Acquired lock {} on services {:?}", info.lock_id, info.service_ids);

        Ok(ServicesLock {
            info,
            _guards: guards,
        })
    }

    /// Drops the lock entry of a service, unless it is held or awaited.
    ///
    /// Returns true if the entry was dropped.
    pub async fn forget_service(&self, service_id: i64) -> bool {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(&service_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1);
        if idle {
            locks.remove(&service_id);
            debug!("Dropped lock entry of service {service_id}");
        }
        idle
    }

    /// Number of services with a lock entry.
    pub async fn tracked_services(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Get or create the lock for a service.
    async fn service_lock(&self, service_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(service_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_sorted_and_deduplicated() {
        let manager = LockManager::new(Duration::from_secs(1));
        let lock = manager.lock_services([3, 1, 2, 1]).await.expect("lock");
        assert_eq!(lock.info().service_ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_overlapping_lock_times_out() {
        let manager = LockManager::new(Duration::from_millis(50));
        let _group = manager.lock_services([1, 2]).await.expect("lock group");

        let err = manager.lock_service(2).await.expect_err("should time out");
        assert!(err.is_retryable());

        // Disjoint services are unaffected
        manager.lock_service(3).await.expect("lock other service");
    }

    #[tokio::test]
    async fn test_forget_service_keeps_held_locks() {
        let manager = LockManager::new(Duration::from_millis(50));
        let held = manager.lock_services([1, 2]).await.expect("lock");
        assert_eq!(manager.tracked_services().await, 2);

        assert!(!manager.forget_service(1).await);
        drop(held);
        assert!(manager.forget_service(1).await);
        assert!(!manager.forget_service(1).await);
        assert_eq!(manager.tracked_services().await, 1);

        manager.lock_service(1).await.expect("relock");
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let manager = LockManager::new(Duration::from_millis(50));
        let first = manager.lock_service(1).await.expect("lock");
        let first_id = first.lock_id().to_string();
        drop(first);

        let second = manager.lock_service(1).await.expect("relock");
        assert_ne!(second.lock_id(), first_id);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
