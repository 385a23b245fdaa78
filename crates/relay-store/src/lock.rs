//! Cross-process mutual exclusion on top of [`CacheBackend`].
//!
//! A lock is a key written with SET-if-absent, a random token and a short TTL.
//! Release deletes the key only while it still holds our token, so a holder
//! whose lock already expired can't free someone else's.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::CacheBackend;
use crate::error::StoreError;

/// Appended to the protected key to form the lock key.
pub const LOCK_SUFFIX: &str = ":lock";

#[derive(Clone, Debug)]
pub struct LockConfig {
    /// Lifetime of an acquired lock if the holder never releases it.
    pub ttl: Duration,
    pub max_attempts: u32,
    pub retry_wait: Duration,
    /// Upper bound of the random delay added to each retry.
    pub jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2),
            max_attempts: 50,
            retry_wait: Duration::from_millis(40),
            jitter: Duration::from_millis(40),
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn CacheBackend>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn CacheBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the lock guarding `key`, retrying with jittered waits.
    pub async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<LockGuard, StoreError> {
        let lock_key = format!("{key}{LOCK_SUFFIX}");
        let token = format!("{:032x}", rand::thread_rng().gen::<u128>());

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            if self
                .backend
                .set_nx(&lock_key, &token, self.config.ttl)
                .await?
            {
                if attempt > 1 {
                    debug!(key = %lock_key, attempt, "lock acquired after contention");
                }
                return Ok(LockGuard {
                    backend: Arc::clone(&self.backend),
                    key: lock_key,
                    token,
                });
            }
            if attempt == self.config.max_attempts {
                break;
            }
            let delay = self.retry_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            }
        }

        warn!(key = %lock_key, attempts = self.config.max_attempts, "lock acquisition timed out");
        Err(StoreError::LockTimeout {
            key: lock_key,
            attempts: self.config.max_attempts,
        })
    }

    fn retry_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.jitter.as_millis()).unwrap_or(0);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.retry_wait + Duration::from_millis(extra)
    }
}

/// Proof of holding a lock. Release explicitly; a dropped guard simply lets
/// the lock expire.
#[must_use = "release the guard once the critical section is done"]
pub struct LockGuard {
    backend: Arc<dyn CacheBackend>,
    key: String,
    token: String,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Delete the lock if it is still ours. `false` means it had already
    /// expired (and may now belong to another holder).
    pub async fn release(self) -> Result<bool, StoreError> {
        let released = self
            .backend
            .compare_and_delete(&self.key, &self.token)
            .await?;
        if !released {
            warn!(key = %self.key, "lock expired before release");
        }
        Ok(released)
    }
}
