//! Per-target advisory lock manager.
//!
//! Acquisition never waits: a held target fails fast with
//! [`ProcessError::LockHeld`] and the message is retried by redelivery.
//! [`TargetLockManager::with_lock`] is the scoped form used by the pipeline;
//! it attempts release on every exit path, including a panic in the body.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use msc_db::{LockAttempt, LockToken, TargetKey, TargetStore};
use tracing::{debug, error, warn};

use crate::ProcessError;

/// Proof of a successful acquisition. Consumed by [`TargetLockManager::release`].
#[derive(Debug)]
pub struct HeldLock {
    key: TargetKey,
    token: LockToken,
    attempt: LockAttempt,
}

impl HeldLock {
    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// How the lock was obtained (`Created`, `Acquired` or `Reclaimed`).
    pub fn attempt(&self) -> LockAttempt {
        self.attempt
    }
}

pub struct TargetLockManager<S: ?Sized> {
    store: Arc<S>,
    lease: Option<Duration>,
}

impl<S: ?Sized> Clone for TargetLockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lease: self.lease,
        }
    }
}

impl<S: TargetStore + ?Sized> TargetLockManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, lease: None }
    }

    /// Allow reclaiming locks held longer than `lease`. `None` disables reclaim.
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Option<Duration> {
        self.lease
    }

    pub async fn acquire(&self, key: &TargetKey) -> Result<HeldLock, ProcessError> {
        let token = LockToken::generate();
        let attempt = self
            .store
            .try_lock(key, &token, self.lease)
            .await
            .map_err(ProcessError::Storage)?;

        match attempt {
            LockAttempt::Held => Err(ProcessError::LockHeld { key: key.clone() }),
            LockAttempt::Reclaimed => {
                warn!(
                    ip = %key.ip,
                    port = key.port,
                    lease_secs = ?self.lease.map(|d| d.as_secs()),
                    "reclaimed lock held past lease"
                );
                Ok(HeldLock {
                    key: key.clone(),
                    token,
                    attempt,
                })
            }
            LockAttempt::Created | LockAttempt::Acquired => {
                debug!(ip = %key.ip, port = key.port, how = attempt.as_str(), "lock acquired");
                Ok(HeldLock {
                    key: key.clone(),
                    token,
                    attempt,
                })
            }
        }
    }

    /// Returns `false` when the stored token no longer matches (nothing cleared).
    pub async fn release(&self, lock: HeldLock) -> anyhow::Result<bool> {
        let released = self.store.unlock(&lock.key, &lock.token).await?;
        if !released {
            warn!(
                ip = %lock.key.ip,
                port = lock.key.port,
                "lock release was a no-op: token no longer current"
            );
        }
        Ok(released)
    }

    /// Run `body` while holding the lock on `key`.
    ///
    /// A release failure is logged and does not change the body's result: the
    /// body's writes are already committed or rolled back at that point.
    pub async fn with_lock<T, F, Fut>(&self, key: &TargetKey, body: F) -> Result<T, ProcessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProcessError>>,
    {
        let lock = self.acquire(key).await?;

        let out = AssertUnwindSafe(body()).catch_unwind().await;

        if let Err(e) = self.release(lock).await {
            error!(
                ip = %key.ip,
                port = key.port,
                error = %format!("{e:#}"),
                "lock release failed; target stays locked"
            );
        }

        match out {
            Ok(res) => res,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
