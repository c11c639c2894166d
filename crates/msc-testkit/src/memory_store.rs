//! In-memory `TargetStore` with the same lock / transaction semantics as the
//! Postgres store.
//!
//! Every operation runs under one mutex, so each call is atomic the way a
//! single SQL statement (or one transaction) is. `with_op_delay` inserts an
//! await point before each operation so concurrent callers interleave.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use msc_db::{
    LockAttempt, LockToken, MessageRow, NewObservation, RecordedObservation, TargetKey, TargetRow,
    TargetStore,
};

#[derive(Default)]
struct State {
    next_target_id: i64,
    next_message_id: i64,
    targets: BTreeMap<TargetKey, TargetRow>,
    messages: Vec<MessageRow>,
    fail_message_inserts: u32,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    op_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn pause(&self) {
        if let Some(d) = self.op_delay {
            tokio::time::sleep(d).await;
        }
    }

    /// The next `n` observation writes fail after the target upsert would
    /// have run; like a rolled-back transaction, nothing is kept.
    pub fn fail_next_message_inserts(&self, n: u32) {
        self.state().fail_message_inserts = n;
    }

    pub fn target(&self, key: &TargetKey) -> Option<TargetRow> {
        self.state().targets.get(key).cloned()
    }

    pub fn messages_for(&self, key: &TargetKey) -> Vec<MessageRow> {
        let st = self.state();
        let Some(target_id) = st.targets.get(key).map(|t| t.id) else {
            return Vec::new();
        };
        st.messages
            .iter()
            .filter(|m| m.target_id == target_id)
            .cloned()
            .collect()
    }

    pub fn target_count(&self) -> usize {
        self.state().targets.len()
    }

    pub fn message_count(&self) -> usize {
        self.state().messages.len()
    }

    /// Pretend the current holder took the lock `by` earlier than it did.
    pub fn backdate_lock(&self, key: &TargetKey, by: Duration) {
        let by =
            chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        if let Some(t) = self.state().targets.get_mut(key) {
            t.lock_acquired_at = t.lock_acquired_at.map(|at| at - by);
        }
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn try_lock(
        &self,
        key: &TargetKey,
        token: &LockToken,
        lease: Option<Duration>,
    ) -> Result<LockAttempt> {
        key.check_storable()?;
        self.pause().await;
        let now = Utc::now();
        let mut guard = self.state();
        let st = &mut *guard;

        let row = match st.targets.entry(key.clone()) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                st.next_target_id += 1;
                v.insert(TargetRow {
                    id: st.next_target_id,
                    ip: key.ip.clone(),
                    port: key.port,
                    service: String::new(),
                    last_updated: None,
                    lock_token: Some(token.as_str().to_string()),
                    lock_acquired_at: Some(now),
                });
                return Ok(LockAttempt::Created);
            }
        };

        let attempt = if !row.is_locked() {
            LockAttempt::Acquired
        } else {
            let expired = match (lease, row.lock_acquired_at) {
                (Some(lease), Some(at)) => (now - at).to_std().is_ok_and(|age| age > lease),
                _ => false,
            };
            if !expired {
                return Ok(LockAttempt::Held);
            }
            LockAttempt::Reclaimed
        };

        row.lock_token = Some(token.as_str().to_string());
        row.lock_acquired_at = Some(now);
        Ok(attempt)
    }

    async fn unlock(&self, key: &TargetKey, token: &LockToken) -> Result<bool> {
        self.pause().await;
        let mut st = self.state();
        match st.targets.get_mut(key) {
            Some(row) if row.lock_token.as_deref() == Some(token.as_str()) => {
                row.lock_token = None;
                row.lock_acquired_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_observation(&self, obs: &NewObservation) -> Result<RecordedObservation> {
        obs.check_storable()?;
        self.pause().await;
        let mut guard = self.state();
        let st = &mut *guard;

        if st.fail_message_inserts > 0 {
            st.fail_message_inserts -= 1;
            bail!("observation_record message insert failed: injected failure");
        }

        let target_id = match st.targets.entry(obs.key.clone()) {
            Entry::Occupied(o) => {
                let row = o.into_mut();
                row.service = obs.service.clone();
                row.last_updated = Some(obs.observed_at);
                row.id
            }
            Entry::Vacant(v) => {
                st.next_target_id += 1;
                v.insert(TargetRow {
                    id: st.next_target_id,
                    ip: obs.key.ip.clone(),
                    port: obs.key.port,
                    service: obs.service.clone(),
                    last_updated: Some(obs.observed_at),
                    lock_token: None,
                    lock_acquired_at: None,
                })
                .id
            }
        };

        st.next_message_id += 1;
        let message_id = st.next_message_id;
        st.messages.push(MessageRow {
            id: message_id,
            target_id,
            message_content: obs.message_content.clone(),
            service: obs.service.clone(),
            response: obs.response.clone(),
            insertion_time: obs.observed_at,
        });

        Ok(RecordedObservation {
            target_id,
            message_id,
        })
    }

    async fn fetch_target(&self, key: &TargetKey) -> Result<Option<TargetRow>> {
        Ok(self.target(key))
    }

    async fn fetch_messages(&self, key: &TargetKey) -> Result<Vec<MessageRow>> {
        Ok(self.messages_for(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TargetKey {
        TargetKey::new("198.51.100.1", 8080)
    }

    #[tokio::test]
    async fn unlock_requires_matching_token() {
        let store = MemoryStore::new();
        let a = LockToken::generate();
        let b = LockToken::generate();

        assert_eq!(store.try_lock(&key(), &a, None).await.unwrap(), LockAttempt::Created);
        assert_eq!(store.try_lock(&key(), &b, None).await.unwrap(), LockAttempt::Held);
        assert!(!store.unlock(&key(), &b).await.unwrap());
        assert!(store.unlock(&key(), &a).await.unwrap());
        assert!(!store.unlock(&key(), &a).await.unwrap());
        assert_eq!(store.try_lock(&key(), &b, None).await.unwrap(), LockAttempt::Acquired);
    }

    #[tokio::test]
    async fn observation_keeps_lock_fields() {
        let store = MemoryStore::new();
        let token = LockToken::generate();
        store.try_lock(&key(), &token, None).await.unwrap();

        let obs = NewObservation {
            key: key(),
            service: "http-alt".to_string(),
            observed_at: Utc::now(),
            message_content: "{}".to_string(),
            response: "ok".to_string(),
        };
        let rec = store.record_observation(&obs).await.unwrap();

        let row = store.target(&key()).unwrap();
        assert_eq!(row.id, rec.target_id);
        assert_eq!(row.lock_token.as_deref(), Some(token.as_str()));
        assert_eq!(row.service, "http-alt");
    }

    #[tokio::test]
    async fn refuses_what_postgres_cannot_store() {
        let store = MemoryStore::new();
        let obs = NewObservation {
            key: key(),
            service: "mysql".to_string(),
            observed_at: Utc::now(),
            message_content: "{}".to_string(),
            response: "J\0\0\0\n5.7.44\0".to_string(),
        };
        let err = store.record_observation(&obs).await.unwrap_err();
        assert!(err.to_string().contains("NUL"), "{err}");
        assert_eq!(store.target_count(), 0);
        assert_eq!(store.message_count(), 0);

        let bad_key = TargetKey::new("198.51.100.1\0", 1);
        assert!(store.try_lock(&bad_key, &LockToken::generate(), None).await.is_err());
        assert_eq!(store.target_count(), 0);
    }

    #[tokio::test]
    async fn unknown_target_unlock_is_false() {
        let store = MemoryStore::new();
        assert!(!store.unlock(&key(), &LockToken::generate()).await.unwrap());
        assert!(store.fetch_target(&key()).await.unwrap().is_none());
        assert!(store.fetch_messages(&key()).await.unwrap().is_empty());
    }
}
