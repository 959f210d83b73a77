use crate::error::{GuardError, Result};
use dashmap::DashMap;
use keel_storage::KeyValueStore;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const LOCK_PREFIX: &str = "keel:lock:";
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Mutual exclusion across processes sharing one key-value store.
///
/// Acquisition is an atomic set-if-absent with a TTL, so a crashed holder
/// frees the lock when the TTL lapses. Release deletes the key only while it
/// still carries this instance's owner token. Work done under the lock must be
/// safe to retry in case the TTL runs out mid-operation.
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    held: DashMap<String, String>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            held: DashMap::new(),
        }
    }

    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_if_absent(&lock_key(key), Value::String(token.clone()), ttl)
            .await?;
        if acquired {
            self.held.insert(key.to_string(), token);
            tracing::trace!(key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        }
        Ok(acquired)
    }

    /// Returns whether the lock was still ours to release.
    pub async fn release(&self, key: &str) -> Result<bool> {
        let Some((_, token)) = self.held.remove(key) else {
            return Ok(false);
        };
        let released = self
            .store
            .delete_if_equals(&lock_key(key), &Value::String(token))
            .await?;
        if !released {
            tracing::warn!(key, "lock expired before release");
        }
        Ok(released)
    }

    /// Acquire `key` (retrying until `wait` elapses), run `work`, release.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let deadline = Instant::now() + wait;
        while !self.acquire(key, ttl).await? {
            if Instant::now() >= deadline {
                return Err(GuardError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }

        let output = work().await;
        if let Err(err) = self.release(key).await {
            tracing::warn!(key, error = %err, "failed to release lock");
        }
        Ok(output)
    }
}

fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}
