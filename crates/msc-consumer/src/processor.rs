use std::sync::Arc;
use std::time::Duration;

use msc_db::{RecordedObservation, TargetKey, TargetStore};
use msc_schemas::decode;

use crate::{ProcessError, Reconciler, TargetLockManager};

/// What the delivery loop should tell the queue about one message.
#[derive(Debug)]
pub enum Outcome {
    Ack(Processed),
    Nack(ProcessError),
}

impl Outcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, Outcome::Ack(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub key: TargetKey,
    pub service: String,
    pub recorded: RecordedObservation,
}

/// decode -> lock -> reconcile -> unlock for a single message body.
pub struct MessageProcessor<S: ?Sized> {
    locks: TargetLockManager<S>,
    reconciler: Reconciler<S>,
}

impl<S: TargetStore + ?Sized> MessageProcessor<S> {
    pub fn new(store: Arc<S>, lease: Option<Duration>) -> Self {
        Self {
            locks: TargetLockManager::new(Arc::clone(&store)).with_lease(lease),
            reconciler: Reconciler::new(store),
        }
    }

    pub fn locks(&self) -> &TargetLockManager<S> {
        &self.locks
    }

    pub async fn process(&self, raw: &[u8]) -> Result<Processed, ProcessError> {
        let record = decode(raw)?;
        let key = TargetKey::new(record.ip.clone(), record.port);

        let recorded = self
            .locks
            .with_lock(&key, || self.reconciler.reconcile(&record, raw))
            .await?;

        Ok(Processed {
            key,
            service: record.service,
            recorded,
        })
    }

    pub async fn handle(&self, raw: &[u8]) -> Outcome {
        match self.process(raw).await {
            Ok(p) => Outcome::Ack(p),
            Err(e) => Outcome::Nack(e),
        }
    }
}
