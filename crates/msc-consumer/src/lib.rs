//! Scan-message consumer core.
//!
//! Pipeline per message: decode -> lock target -> reconcile -> unlock -> ack/nack.
//! Storage is injected as a [`msc_db::TargetStore`]; the queue as a
//! [`Subscription`].

mod delivery;
mod error;
mod local_queue;
mod lock;
mod processor;
mod reconcile;

pub use delivery::{DeliveryLoop, DeliveryReport, Message, Subscription};
pub use error::ProcessError;
pub use local_queue::{DeadLetter, LocalQueue, QueueStats};
pub use lock::{HeldLock, TargetLockManager};
pub use processor::{MessageProcessor, Outcome, Processed};
pub use reconcile::Reconciler;
