//! Per-user lock registry.
//!
//! Tasks for the same user must never interleave. Each user gets an async
//! mutex on first use; the entry is dropped again when the last holder
//! releases it, so the registry only ever contains users with work in flight.

use std::sync::Arc;

use dashmap::DashMap;
use provisioning_sdk::UserId;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct UserLocks {
    inner: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`.
    pub async fn acquire(&self, user_id: &UserId) -> UserGuard {
        let lock = self
            .inner
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;

        UserGuard {
            user_id: user_id.clone(),
            registry: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of users with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Exclusive access to one user. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct UserGuard {
    user_id: UserId,
    registry: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the registry itself still references the mutex: nobody holds
        // or waits on it.
        self.registry
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
