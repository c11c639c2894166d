use std::sync::Arc;
use std::time::Duration;

use msc_consumer::{DeliveryLoop, LocalQueue, MessageProcessor};
use msc_testkit::{scan_message_v2, MemoryStore};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_pulling_but_finishes_started_messages() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new().with_op_delay(Duration::from_millis(40)));
    let queue = Arc::new(LocalQueue::new(5, Duration::ZERO));

    for i in 0..4u8 {
        queue.publish(scan_message_v2(&format!("10.5.0.{i}"), 443, "https", 1, "hi"));
    }

    let cancel = CancellationToken::new();
    let processor = Arc::new(MessageProcessor::new(Arc::clone(&store), None));
    let run = tokio::spawn({
        let dl = DeliveryLoop::new(processor, Arc::clone(&queue), 4);
        let cancel = cancel.clone();
        async move { dl.run(cancel).await }
    });

    // Wait until all four are in flight, then cancel mid-processing.
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.stats().in_flight < 4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await?;
    cancel.cancel();

    queue.publish(scan_message_v2("10.5.0.99", 443, "https", 2, "late"));

    let report = run.await??;
    assert_eq!(report.received, 4);
    assert_eq!(report.acked, 4, "in-flight work is drained, not aborted");
    assert_eq!(store.message_count(), 4);

    let stats = queue.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.acked, 4);
    assert_eq!(stats.ready, 1, "nothing pulled after cancellation");
    Ok(())
}
