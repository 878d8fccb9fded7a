//! Partition hand-off between members of one group

mod common;

use common::*;
use krimson::{
    MemoryBroker, MetricsInterceptor, Processor, ProcessorContext, ProcessorEvent, TopicPartition,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn member(
    broker: &MemoryBroker,
    client_id: &str,
    handled: Arc<Mutex<Vec<i64>>>,
    revoked: Arc<Mutex<Vec<TopicPartition>>>,
) -> (Processor, MetricsInterceptor) {
    let mut options = options(client_id, "input");
    options.group_id = Some("workers".into());
    let metrics = MetricsInterceptor::new();
    let processor = Processor::builder()
        .options(options)
        .codec(codec())
        .clients(Arc::new(broker.clone()))
        .intercept(Arc::new(metrics.clone()), false)
        .intercept(
            Arc::new(move |event: &ProcessorEvent<'_>| {
                if let ProcessorEvent::PartitionsRevoked { partitions, .. } = event {
                    revoked.lock().extend(partitions.iter().cloned());
                }
            }),
            false,
        )
        .process(move |note: &Note, _: &ProcessorContext| {
            handled.lock().push(note.seq);
            Ok(())
        })
        .build()
        .unwrap();
    (processor, metrics)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_member_takes_over_partitions_without_loss() {
    let broker = MemoryBroker::new();
    broker.create_topic("input", 2);
    produce_notes(&broker, "input", 0..40);

    let handled = Arc::new(Mutex::new(Vec::new()));
    let revoked = Arc::new(Mutex::new(Vec::new()));
    let (first, first_metrics) = member(&broker, "worker-1", handled.clone(), revoked.clone());
    let (_, first_run) = spawn_activate(&first);
    wait_caught_up(&first).await;
    assert_eq!(first.subscription_gap().await.unwrap()[0].partitions.len(), 2);

    let (second, _) = member(&broker, "worker-2", handled.clone(), revoked.clone());
    let (_, second_run) = spawn_activate(&second);
    wait_until(|| !revoked.lock().is_empty()).await;
    wait_caught_up(&second).await;

    produce_notes(&broker, "input", 40..80);
    wait_caught_up(&first).await;
    wait_caught_up(&second).await;
    assert_eq!(first.subscription_gap().await.unwrap()[0].partitions.len(), 1);
    assert_eq!(second.subscription_gap().await.unwrap()[0].partitions.len(), 1);

    first.terminate().await;
    second.terminate().await;
    first_run.await.unwrap().unwrap();
    second_run.await.unwrap().unwrap();

    let distinct: BTreeSet<i64> = handled.lock().iter().copied().collect();
    assert_eq!(distinct, (0..80).collect::<BTreeSet<_>>());
    assert!(first_metrics.metrics().snapshot().rebalances >= 2);

    for partition in 0..2 {
        let tp = TopicPartition::new("input", partition);
        let end = broker
            .records("input")
            .iter()
            .filter(|record| record.id.partition == partition)
            .count() as i64;
        assert_eq!(broker.committed_offset("workers", &tp), Some(end));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_member_rejoins_without_loss() {
    let broker = MemoryBroker::new();
    broker.create_topic("input", 2);
    produce_notes(&broker, "input", 0..20);

    let handled = Arc::new(Mutex::new(Vec::new()));
    let lost = Arc::new(Mutex::new(Vec::new()));
    let commit_failures = Arc::new(AtomicUsize::new(0));

    let seen = handled.clone();
    let observed = lost.clone();
    let failures = commit_failures.clone();
    let processor = Processor::builder()
        .options(options("expiring", "input"))
        .codec(codec())
        .clients(Arc::new(broker.clone()))
        .intercept(
            Arc::new(move |event: &ProcessorEvent<'_>| match event {
                ProcessorEvent::PartitionsLost { partitions, .. } => {
                    observed.lock().extend(partitions.iter().cloned());
                }
                ProcessorEvent::CommitFailed { .. } => {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }),
            false,
        )
        .process(move |note: &Note, _: &ProcessorContext| {
            seen.lock().push(note.seq);
            Ok(())
        })
        .build()
        .unwrap();

    let (_, run) = spawn_activate(&processor);
    wait_caught_up(&processor).await;

    let members = broker.members("expiring");
    assert_eq!(members.len(), 1);
    broker.expire_member("expiring", members[0]);
    wait_until(|| lost.lock().len() == 2).await;

    produce_notes(&broker, "input", 20..40);
    wait_caught_up(&processor).await;
    assert_eq!(processor.subscription_gap().await.unwrap()[0].partitions.len(), 2);

    processor.terminate().await;
    run.await.unwrap().unwrap();

    let distinct: BTreeSet<i64> = handled.lock().iter().copied().collect();
    assert_eq!(distinct, (0..40).collect::<BTreeSet<_>>());
    assert_eq!(commit_failures.load(Ordering::SeqCst), 0);

    for partition in 0..2 {
        let tp = TopicPartition::new("input", partition);
        let end = broker
            .records("input")
            .iter()
            .filter(|record| record.id.partition == partition)
            .count() as i64;
        assert_eq!(broker.committed_offset("expiring", &tp), Some(end));
    }
}
