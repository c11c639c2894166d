//! Delivery loop: pull messages, process them concurrently, settle each one.
//!
//! Rules:
//! - one spawned task per message, at most `max_in_flight` at a time
//! - a failing (or panicking) message is nacked; the loop keeps pulling
//! - cancellation stops pulling; tasks already spawned run to completion and
//!   are drained before `run` returns

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use msc_db::TargetStore;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{MessageProcessor, Outcome, ProcessError};

/// One delivery of an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Queue-assigned id; stable across redeliveries of the same payload.
    pub id: u64,
    pub data: Vec<u8>,
    /// 1 on first delivery.
    pub delivery_attempt: u32,
}

/// Queue collaborator. `ack` / `nack` are called exactly once per received message.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits for the next message. `Ok(None)` means the subscription is closed.
    async fn receive(&self) -> Result<Option<Message>>;

    async fn ack(&self, msg: &Message) -> Result<()>;

    async fn nack(&self, msg: &Message) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub received: u64,
    pub acked: u64,
    pub nacked_decode: u64,
    pub nacked_lock_contention: u64,
    pub nacked_storage: u64,
    /// Handler panicked; counted separately and nacked.
    pub nacked_panic: u64,
    /// ack/nack calls the queue rejected.
    pub settle_failures: u64,
}

impl DeliveryReport {
    pub fn nacked(&self) -> u64 {
        self.nacked_decode + self.nacked_lock_contention + self.nacked_storage + self.nacked_panic
    }
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    acked: AtomicU64,
    nacked_decode: AtomicU64,
    nacked_lock_contention: AtomicU64,
    nacked_storage: AtomicU64,
    nacked_panic: AtomicU64,
    settle_failures: AtomicU64,
}

impl Counters {
    fn bump(c: &AtomicU64) {
        c.fetch_add(1, Ordering::Relaxed);
    }

    fn nacked(&self, err: &ProcessError) {
        match err {
            ProcessError::Decode(_) => Self::bump(&self.nacked_decode),
            ProcessError::LockHeld { .. } => Self::bump(&self.nacked_lock_contention),
            ProcessError::Storage(_) => Self::bump(&self.nacked_storage),
        }
    }

    fn snapshot(&self) -> DeliveryReport {
        DeliveryReport {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked_decode: self.nacked_decode.load(Ordering::Relaxed),
            nacked_lock_contention: self.nacked_lock_contention.load(Ordering::Relaxed),
            nacked_storage: self.nacked_storage.load(Ordering::Relaxed),
            nacked_panic: self.nacked_panic.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct DeliveryLoop<S: ?Sized, Q: ?Sized> {
    processor: Arc<MessageProcessor<S>>,
    subscription: Arc<Q>,
    max_in_flight: usize,
}

impl<S, Q> DeliveryLoop<S, Q>
where
    S: TargetStore + ?Sized + 'static,
    Q: Subscription + ?Sized + 'static,
{
    pub fn new(
        processor: Arc<MessageProcessor<S>>,
        subscription: Arc<Q>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            processor,
            subscription,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Runs until the subscription closes or `cancel` fires, then drains.
    ///
    /// Returns `Err` only when the subscription itself fails to deliver; the
    /// report of what was settled before that is logged.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DeliveryReport> {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let counters = Arc::new(Counters::default());
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut receive_error: Option<anyhow::Error> = None;

        info!(max_in_flight = self.max_in_flight, "delivery loop started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                reap(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                p = Arc::clone(&permits).acquire_owned() => p.context("delivery semaphore closed")?,
            };

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                m = self.subscription.receive() => m,
            };

            let msg = match received {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("subscription closed");
                    break;
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "receive failed; stopping delivery loop");
                    receive_error = Some(e);
                    break;
                }
            };
            Counters::bump(&counters.received);

            let processor = Arc::clone(&self.processor);
            let subscription = Arc::clone(&self.subscription);
            let counters = Arc::clone(&counters);
            tasks.spawn(async move {
                let _permit = permit;
                deliver_one(&*processor, &*subscription, &counters, msg).await;
            });
        }

        if cancel.is_cancelled() {
            info!(in_flight = tasks.len(), "cancellation requested; draining in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }

        let report = counters.snapshot();
        info!(
            received = report.received,
            acked = report.acked,
            nacked = report.nacked(),
            settle_failures = report.settle_failures,
            "delivery loop stopped"
        );

        match receive_error {
            Some(e) => Err(e.context("subscription receive failed")),
            None => Ok(report),
        }
    }
}

async fn deliver_one<S, Q>(
    processor: &MessageProcessor<S>,
    subscription: &Q,
    counters: &Counters,
    msg: Message,
) where
    S: TargetStore + ?Sized,
    Q: Subscription + ?Sized,
{
    let outcome = AssertUnwindSafe(processor.handle(&msg.data)).catch_unwind().await;

    let settled = match outcome {
        Ok(Outcome::Ack(p)) => {
            debug!(
                message_id = msg.id,
                attempt = msg.delivery_attempt,
                ip = %p.key.ip,
                port = p.key.port,
                service = %p.service,
                target_id = p.recorded.target_id,
                "message processed"
            );
            Counters::bump(&counters.acked);
            subscription.ack(&msg).await
        }
        Ok(Outcome::Nack(err)) => {
            log_nack(&msg, &err);
            counters.nacked(&err);
            subscription.nack(&msg).await
        }
        Err(_) => {
            error!(
                message_id = msg.id,
                attempt = msg.delivery_attempt,
                error_kind = "panic",
                "message handler panicked"
            );
            Counters::bump(&counters.nacked_panic);
            subscription.nack(&msg).await
        }
    };

    if let Err(e) = settled {
        Counters::bump(&counters.settle_failures);
        error!(message_id = msg.id, error = %format!("{e:#}"), "failed to settle message");
    }
}

fn log_nack(msg: &Message, err: &ProcessError) {
    match err {
        ProcessError::Decode(_) => warn!(
            message_id = msg.id,
            attempt = msg.delivery_attempt,
            error_kind = err.kind(),
            error = %err,
            "undecodable message"
        ),
        ProcessError::LockHeld { key } => info!(
            message_id = msg.id,
            attempt = msg.delivery_attempt,
            ip = %key.ip,
            port = key.port,
            error_kind = err.kind(),
            "target busy; will be redelivered"
        ),
        ProcessError::Storage(_) => error!(
            message_id = msg.id,
            attempt = msg.delivery_attempt,
            error_kind = err.kind(),
            error = %err,
            "storage failure"
        ),
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "delivery task ended abnormally");
    }
}
