//! Reconciliation: fold one decoded scan record into the store.
//!
//! Must run under the target's lock. The target upsert and the message append
//! are a single storage unit; on failure neither is visible.

use std::sync::Arc;

use msc_db::{NewObservation, RecordedObservation, TargetKey, TargetStore};
use msc_schemas::ScanRecord;
use tracing::debug;

use crate::ProcessError;

pub struct Reconciler<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TargetStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// `raw` is the message body as received; it is stored verbatim (lossy
    /// UTF-8) alongside the decoded response.
    pub async fn reconcile(
        &self,
        record: &ScanRecord,
        raw: &[u8],
    ) -> Result<RecordedObservation, ProcessError> {
        let obs = NewObservation {
            key: TargetKey::new(record.ip.clone(), record.port),
            service: record.service.clone(),
            observed_at: record.observed_at(),
            message_content: String::from_utf8_lossy(raw).into_owned(),
            response: record.response.clone(),
        };

        let recorded = self
            .store
            .record_observation(&obs)
            .await
            .map_err(ProcessError::Storage)?;

        debug!(
            ip = %obs.key.ip,
            port = obs.key.port,
            service = %obs.service,
            target_id = recorded.target_id,
            message_id = recorded.message_id,
            "observation recorded"
        );
        Ok(recorded)
    }
}
