use std::sync::Arc;
use std::time::Duration;

use msc_consumer::{DeliveryLoop, LocalQueue, MessageProcessor};
use msc_db::TargetKey;
use msc_testkit::{scan_message_v2, MemoryStore};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn failed_reconcile_releases_lock_and_retry_succeeds() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(LocalQueue::new(3, Duration::from_millis(2)));
    let key = TargetKey::new("10.4.0.1", 5432);

    store.fail_next_message_inserts(1);
    queue.publish(scan_message_v2("10.4.0.1", 5432, "postgres", 77, "FATAL: no pg_hba.conf entry"));
    queue.close();

    let processor = Arc::new(MessageProcessor::new(Arc::clone(&store), None));
    let report = DeliveryLoop::new(processor, Arc::clone(&queue), 1)
        .run(CancellationToken::new())
        .await?;

    assert_eq!(report.nacked_storage, 1);
    assert_eq!(report.nacked_lock_contention, 0, "lock from the failed attempt must not linger");
    assert_eq!(report.acked, 1);

    let target = store.target(&key).expect("target");
    assert!(!target.is_locked());
    assert_eq!(target.service, "postgres");
    assert_eq!(store.messages_for(&key).len(), 1, "no partial write from the failed attempt");
    Ok(())
}
