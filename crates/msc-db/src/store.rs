//! Storage boundary consumed by the lock manager and reconciliation engine.
//!
//! The consumer never touches a pool directly; it is handed a `TargetStore`
//! so the same pipeline runs against Postgres or an in-memory store.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    LockAttempt, LockToken, MessageRow, NewObservation, RecordedObservation, TargetKey, TargetRow,
};

/// Implementations must be `Send + Sync`; one store is shared by every
/// in-flight message task.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Non-blocking lock attempt. See [`LockAttempt`] for outcomes.
    async fn try_lock(
        &self,
        key: &TargetKey,
        token: &LockToken,
        lease: Option<Duration>,
    ) -> Result<LockAttempt>;

    /// Clear the lock iff `token` is the current holder.
    async fn unlock(&self, key: &TargetKey, token: &LockToken) -> Result<bool>;

    /// Target upsert + message append as one unit: both rows or neither.
    async fn record_observation(&self, obs: &NewObservation) -> Result<RecordedObservation>;

    async fn fetch_target(&self, key: &TargetKey) -> Result<Option<TargetRow>>;

    async fn fetch_messages(&self, key: &TargetKey) -> Result<Vec<MessageRow>>;
}

#[derive(Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn try_lock(
        &self,
        key: &TargetKey,
        token: &LockToken,
        lease: Option<Duration>,
    ) -> Result<LockAttempt> {
        crate::target_try_lock(&self.pool, key, token, lease).await
    }

    async fn unlock(&self, key: &TargetKey, token: &LockToken) -> Result<bool> {
        crate::target_unlock(&self.pool, key, token).await
    }

    async fn record_observation(&self, obs: &NewObservation) -> Result<RecordedObservation> {
        crate::observation_record(&self.pool, obs).await
    }

    async fn fetch_target(&self, key: &TargetKey) -> Result<Option<TargetRow>> {
        crate::target_fetch(&self.pool, key).await
    }

    async fn fetch_messages(&self, key: &TargetKey) -> Result<Vec<MessageRow>> {
        crate::messages_fetch_for_target(&self.pool, key).await
    }
}
