use std::sync::Arc;
use std::time::Duration;

use msc_consumer::{DeliveryLoop, LocalQueue, MessageProcessor};
use msc_db::TargetKey;
use msc_testkit::{scan_message_v2, MemoryStore};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn message_for_locked_target_is_redelivered_until_lock_frees() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(LocalQueue::new(10_000, Duration::from_millis(5)));
    let processor = Arc::new(MessageProcessor::new(Arc::clone(&store), None));
    let key = TargetKey::new("10.3.0.1", 3306);

    // Another consumer instance holds the target.
    let other = processor.locks().acquire(&key).await?;

    queue.publish(scan_message_v2("10.3.0.1", 3306, "mysql", 50, "5.7.44"));
    queue.close();

    let run = tokio::spawn({
        let dl = DeliveryLoop::new(Arc::clone(&processor), Arc::clone(&queue), 4);
        async move { dl.run(CancellationToken::new()).await }
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(store.messages_for(&key).is_empty(), "no write while the lock is held elsewhere");
    assert!(!run.is_finished());

    assert!(processor.locks().release(other).await?);

    let report = run.await??;
    assert_eq!(report.acked, 1);
    assert!(report.nacked_lock_contention >= 1);
    assert_eq!(report.nacked_decode + report.nacked_storage, 0);

    let msgs = store.messages_for(&key);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].response, "5.7.44");
    assert!(!store.target(&key).expect("target").is_locked());
    Ok(())
}
