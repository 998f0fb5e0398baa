//! Per-session mutual exclusion for mutating operations

use crate::error::{MemoryError, Result};
use crate::types::SessionKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Held while mutating one session; released on drop
pub type SessionGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: RwLock<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `key`
    pub async fn acquire(&self, key: &SessionKey, timeout: Duration) -> Result<SessionGuard> {
        let lock = self.lock_for(key).await;
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(
                    namespace = %key.namespace,
                    session_id = %key.session_id,
                    waited_ms = timeout.as_millis() as u64,
                    "session lock timeout"
                );
                Err(MemoryError::ConcurrencyTimeout {
                    namespace: key.namespace.clone(),
                    session_id: key.session_id.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return Arc::clone(lock);
            }
        }

        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Forget `key`'s lock once nobody holds or waits on it
    pub async fn release(&self, key: &SessionKey) {
        let mut locks = self.locks.write().await;
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.locks.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = SessionLocks::new();
        let key = SessionKey::new("ns", "s");

        let _held = locks.acquire(&key, Duration::from_millis(50)).await.unwrap();
        let err = locks
            .acquire(&key, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::ConcurrencyTimeout { .. }));
    }

    #[tokio::test]
    async fn different_sessions_do_not_contend() {
        let locks = SessionLocks::new();
        let _a = locks
            .acquire(&SessionKey::new("ns", "a"), Duration::from_millis(20))
            .await
            .unwrap();
        let b = locks
            .acquire(&SessionKey::new("ns", "b"), Duration::from_millis(20))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn release_keeps_held_locks() {
        let locks = SessionLocks::new();
        let a = SessionKey::new("ns", "a");
        let b = SessionKey::new("ns", "b");
        let held = locks.acquire(&a, Duration::from_millis(20)).await.unwrap();
        drop(locks.acquire(&b, Duration::from_millis(20)).await.unwrap());

        locks.release(&a).await;
        locks.release(&b).await;
        assert_eq!(locks.len().await, 1);

        drop(held);
        locks.release(&a).await;
        assert_eq!(locks.len().await, 0);
    }
}
