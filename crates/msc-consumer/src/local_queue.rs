//! In-process at-least-once queue.
//!
//! Backs `msc consume` replays and the delivery tests. Nacked messages become
//! visible again after `redelivery_delay`; after `max_delivery_attempts`
//! deliveries a nacked message is dead-lettered instead.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::{Message, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub id: u64,
    pub data: Vec<u8>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub acked: u64,
    pub dead_lettered: usize,
}

struct Pending {
    id: u64,
    data: Vec<u8>,
    attempts: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Pending>,
    in_flight: HashMap<u64, Pending>,
    acked: u64,
    dead: Vec<DeadLetter>,
    closed: bool,
}

impl QueueState {
    fn settled(&self) -> bool {
        self.ready.is_empty() && self.in_flight.is_empty()
    }
}

pub struct LocalQueue {
    state: Mutex<QueueState>,
    changed: Notify,
    max_delivery_attempts: u32,
    redelivery_delay: Duration,
}

impl LocalQueue {
    pub fn new(max_delivery_attempts: u32, redelivery_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
            max_delivery_attempts: max_delivery_attempts.max(1),
            redelivery_delay,
        }
    }

    // A panic while holding the guard leaves the state consistent (every
    // mutation is a single push/remove), so poisoning is ignored.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a payload for immediate delivery. Returns its id.
    pub fn publish(&self, data: Vec<u8>) -> u64 {
        let id = {
            let mut st = self.state();
            st.next_id += 1;
            let id = st.next_id;
            st.ready.push_back(Pending {
                id,
                data,
                attempts: 0,
                visible_at: Instant::now(),
            });
            id
        };
        self.changed.notify_waiters();
        id
    }

    /// No further publishes are expected. `receive` returns `None` once every
    /// message is acked or dead-lettered.
    pub fn close(&self) {
        self.state().closed = true;
        self.changed.notify_waiters();
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.state();
        QueueStats {
            ready: st.ready.len(),
            in_flight: st.in_flight.len(),
            acked: st.acked,
            dead_lettered: st.dead.len(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead.clone()
    }
}

#[async_trait]
impl Subscription for LocalQueue {
    async fn receive(&self) -> Result<Option<Message>> {
        loop {
            // Register interest before inspecting state so a change between
            // the check and the wait is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = {
                let mut st = self.state();
                let now = Instant::now();
                if let Some(pos) = st.ready.iter().position(|p| p.visible_at <= now) {
                    if let Some(mut p) = st.ready.remove(pos) {
                        p.attempts += 1;
                        let msg = Message {
                            id: p.id,
                            data: p.data.clone(),
                            delivery_attempt: p.attempts,
                        };
                        st.in_flight.insert(p.id, p);
                        return Ok(Some(msg));
                    }
                }
                if st.closed && st.settled() {
                    return Ok(None);
                }
                st.ready.iter().map(|p| p.visible_at).min()
            };

            match next_visible {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, msg: &Message) -> Result<()> {
        {
            let mut st = self.state();
            if st.in_flight.remove(&msg.id).is_none() {
                bail!("ack for unknown delivery id {}", msg.id);
            }
            st.acked += 1;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn nack(&self, msg: &Message) -> Result<()> {
        {
            let mut st = self.state();
            let Some(mut p) = st.in_flight.remove(&msg.id) else {
                bail!("nack for unknown delivery id {}", msg.id);
            };
            if p.attempts >= self.max_delivery_attempts {
                warn!(
                    message_id = p.id,
                    attempt = p.attempts,
                    "max delivery attempts reached; dead-lettering"
                );
                st.dead.push(DeadLetter {
                    id: p.id,
                    data: p.data,
                    attempts: p.attempts,
                });
            } else {
                p.visible_at = Instant::now() + self.redelivery_delay;
                st.ready.push_back(p);
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order_and_closes_when_settled() {
        let q = LocalQueue::new(3, Duration::from_millis(1));
        let a = q.publish(b"a".to_vec());
        let b = q.publish(b"b".to_vec());
        q.close();

        let m1 = q.receive().await.unwrap().unwrap();
        let m2 = q.receive().await.unwrap().unwrap();
        assert_eq!((m1.id, m1.delivery_attempt, m1.data.as_slice()), (a, 1, &b"a"[..]));
        assert_eq!(m2.id, b);
        assert_eq!(q.stats().in_flight, 2);

        q.ack(&m1).await.unwrap();
        q.ack(&m2).await.unwrap();
        assert!(q.receive().await.unwrap().is_none());
        assert_eq!(q.stats().acked, 2);
    }

    #[tokio::test]
    async fn nack_redelivers_after_delay_with_incremented_attempt() {
        let q = LocalQueue::new(3, Duration::from_millis(20));
        q.publish(b"x".to_vec());

        let first = q.receive().await.unwrap().unwrap();
        let nacked_at = Instant::now();
        q.nack(&first).await.unwrap();

        let again = q.receive().await.unwrap().unwrap();
        assert!(nacked_at.elapsed() >= Duration::from_millis(20));
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_message_is_dead_lettered() {
        let q = LocalQueue::new(2, Duration::ZERO);
        q.publish(b"poison".to_vec());
        q.close();

        let m = q.receive().await.unwrap().unwrap();
        q.nack(&m).await.unwrap();
        let m = q.receive().await.unwrap().unwrap();
        assert_eq!(m.delivery_attempt, 2);
        q.nack(&m).await.unwrap();

        assert!(q.receive().await.unwrap().is_none());
        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].data, b"poison");
    }

    #[tokio::test]
    async fn receive_waits_for_publish() {
        let q = std::sync::Arc::new(LocalQueue::new(1, Duration::ZERO));

        let waiter = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        q.publish(b"late".to_vec());
        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.data, b"late");
    }

    #[tokio::test]
    async fn settling_unknown_delivery_fails() {
        let q = LocalQueue::new(1, Duration::ZERO);
        let bogus = Message {
            id: 42,
            data: Vec::new(),
            delivery_attempt: 1,
        };
        assert!(q.ack(&bogus).await.is_err());
        assert!(q.nack(&bogus).await.is_err());
    }

    #[tokio::test]
    async fn closed_queue_waits_for_in_flight_before_ending() {
        let q = std::sync::Arc::new(LocalQueue::new(1, Duration::ZERO));
        q.publish(b"m".to_vec());
        q.close();
        let m = q.receive().await.unwrap().unwrap();

        let waiter = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        q.ack(&m).await.unwrap();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }
}
