//! Working memory: the per-session message window and rolling context
//!
//! Wraps [`SessionStore`] with per-session locking so that appends,
//! context replacement and deletes on one session never interleave.

use crate::error::{MemoryError, Result};
use crate::locks::SessionLocks;
#[cfg(test)]
use crate::locks::SessionGuard;
use crate::store::SessionStore;
use crate::tokens::TokenAccountant;
use crate::types::{MemoryMessage, Page, Role, Session, SessionKey, SessionList};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkingMemoryStore {
    store: SessionStore,
    locks: Arc<SessionLocks>,
    accountant: TokenAccountant,
    lock_timeout: Duration,
}

impl WorkingMemoryStore {
    pub fn new(store: SessionStore, accountant: TokenAccountant, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks: Arc::new(SessionLocks::new()),
            accountant,
            lock_timeout,
        }
    }

    pub fn accountant(&self) -> &TokenAccountant {
        &self.accountant
    }

    /// Run `op` holding `key`'s lock, then drop the lock entry if idle
    async fn locked<T, F, Fut>(&self, key: &SessionKey, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = {
            let _guard = self.locks.acquire(key, self.lock_timeout).await?;
            op().await
        };
        self.locks.release(key).await;
        result
    }

    #[cfg(test)]
    pub(crate) async fn hold(&self, key: &SessionKey) -> Result<SessionGuard> {
        self.locks.acquire(key, self.lock_timeout).await
    }

    /// Durably append messages; nothing is stored if any message is invalid
    pub async fn append(
        &self,
        key: &SessionKey,
        messages: &[MemoryMessage],
        context: Option<&str>,
    ) -> Result<usize> {
        let validated = messages
            .iter()
            .map(|m| m.validate().map(|role| (role, m.content.clone())))
            .collect::<Result<Vec<(Role, String)>>>()?;

        let token_count = self
            .locked(key, || {
                self.store.append(key, &validated, context, &self.accountant)
            })
            .await?;

        tracing::debug!(
            namespace = %key.namespace,
            session_id = %key.session_id,
            appended = validated.len(),
            tokens = token_count,
            "appended to working memory"
        );
        Ok(token_count)
    }

    pub async fn read(&self, key: &SessionKey) -> Result<Session> {
        self.store
            .read(key)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("session {key}")))
    }

    /// Bump `last_accessed`
    pub async fn touch(&self, key: &SessionKey) -> Result<()> {
        self.locked(key, || self.store.touch(key)).await
    }

    /// Commit a summarization result. `epoch` must match the session the
    /// summary was computed from, otherwise `NotFound` is returned and
    /// nothing changes.
    pub async fn replace_context_and_trim(
        &self,
        key: &SessionKey,
        epoch: &str,
        new_context: &str,
        evicted_through: Option<i64>,
    ) -> Result<usize> {
        self.locked(key, || {
            self.store
                .replace_context_and_trim(key, epoch, new_context, evicted_through, &self.accountant)
        })
        .await
    }

    pub async fn truncate_message(
        &self,
        key: &SessionKey,
        epoch: &str,
        ordinal: i64,
        content: &str,
    ) -> Result<usize> {
        self.locked(key, || {
            self.store
                .truncate_message(key, epoch, ordinal, content, &self.accountant)
        })
        .await
    }

    pub async fn delete(&self, key: &SessionKey) -> Result<()> {
        if self.locked(key, || self.store.delete(key)).await? {
            Ok(())
        } else {
            Err(MemoryError::NotFound(format!("session {key}")))
        }
    }

    pub async fn list_sessions(&self, namespace: &str, page: Page) -> Result<SessionList> {
        self.store.list_sessions(namespace, page).await
    }
}
