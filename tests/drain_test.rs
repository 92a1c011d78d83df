mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, payload_from, FlakyLog, ScriptedDownstream};
use tokio_util::sync::CancellationToken;
use webhook_relay::{
    DeliveryFailure, Drain, DrainConfig, DurableLog, InMemoryLog, PartitionId, RecordOutcome, RetryPolicy, RoutingKey,
};

fn drain_config(dead_letter: bool) -> DrainConfig {
    DrainConfig {
        retry: RetryPolicy::fixed(5, Duration::from_secs(20)),
        delivery_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(500),
        infra_backoff: Duration::from_secs(1),
        partitions: None,
        dead_letter,
    }
}

async fn stop(shutdown: CancellationToken, workers: Vec<tokio::task::JoinHandle<()>>) {
    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_event_delivered_on_first_attempt() {
    let log = Arc::new(InMemoryLog::new(4));
    let downstream = ScriptedDownstream::always(Ok(()));
    let body = payload_from("15551234567", "hello");
    log.append(&RoutingKey::new("15551234567"), &body).await.unwrap();

    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), drain_config(false)));
    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());
    assert_eq!(workers.len(), 4);

    assert!(eventually(|| async { log.total_pending().await == 0 }).await);
    stop(shutdown, workers).await;

    // Delivered once, byte for byte, nothing parked
    assert_eq!(downstream.payloads(), vec![body]);
    assert!(log.dead_letters().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_permanently_failing_record_is_discarded_after_max_retries() {
    let log = Arc::new(InMemoryLog::new(2));
    let downstream = ScriptedDownstream::always(Err(DeliveryFailure::Status(500)));
    let key = RoutingKey::new("15550000001");
    let position = log.append(&key, b"poison").await.unwrap();

    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), drain_config(true)));
    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());

    assert!(eventually(|| async { log.total_pending().await == 0 }).await);

    // Nothing else is attempted once the record is committed
    tokio::time::sleep(Duration::from_secs(120)).await;
    stop(shutdown, workers).await;

    assert_eq!(downstream.call_count(), 5);

    let times = downstream.call_times();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(20));
    }

    let parked = log.dead_letters().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].key, key);
    assert_eq!(parked[0].partition, position.partition);
    assert_eq!(parked[0].offset, position.offset);
    assert_eq!(parked[0].payload, b"poison");
    assert_eq!(parked[0].attempts, 5);
    assert_eq!(parked[0].last_failure, DeliveryFailure::Status(500).to_string());
}

#[tokio::test(start_paused = true)]
async fn test_discard_without_dead_letter_still_commits() {
    let log = Arc::new(InMemoryLog::new(1));
    let downstream = ScriptedDownstream::always(Err(DeliveryFailure::Timeout));
    log.append(&RoutingKey::sentinel(), b"{}").await.unwrap();

    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), drain_config(false)));
    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());

    assert!(eventually(|| async { log.total_pending().await == 0 }).await);
    stop(shutdown, workers).await;

    assert_eq!(downstream.call_count(), 5);
    assert!(log.dead_letters().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_mid_retry_delivers_without_discard() {
    let log = Arc::new(InMemoryLog::new(1));
    let downstream = ScriptedDownstream::scripted(
        vec![Err(DeliveryFailure::Network), Err(DeliveryFailure::Status(503))],
        Ok(()),
    );
    log.append(&RoutingKey::new("a"), b"one").await.unwrap();

    let drain = Drain::new(log.clone(), downstream.clone(), drain_config(true));
    let record = log.fetch(PartitionId(0)).await.unwrap().unwrap();
    let outcome = drain.process_record(&record, &CancellationToken::new()).await;

    assert_eq!(outcome, Some(RecordOutcome::Delivered { attempts: 3 }));
    assert_eq!(downstream.call_count(), 3);
    assert!(log.dead_letters().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_key_records_are_delivered_in_order() {
    let log = Arc::new(InMemoryLog::new(8));
    // First record fails twice before succeeding; the second must wait
    let downstream = ScriptedDownstream::scripted(
        vec![Err(DeliveryFailure::Status(502)), Err(DeliveryFailure::Status(502))],
        Ok(()),
    );
    let key = RoutingKey::new("15557654321");
    let a = payload_from("15557654321", "A");
    let b = payload_from("15557654321", "B");
    log.append(&key, &a).await.unwrap();
    log.append(&key, &b).await.unwrap();

    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), drain_config(false)));
    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());

    assert!(eventually(|| async { log.total_pending().await == 0 }).await);
    stop(shutdown, workers).await;

    assert_eq!(downstream.payloads(), vec![a.clone(), a.clone(), a, b]);
}

#[tokio::test(start_paused = true)]
async fn test_broker_faults_never_skip_or_redeliver() {
    let log = Arc::new(FlakyLog::new(1).fail_fetches(3).fail_commits(2));
    let downstream = ScriptedDownstream::always(Ok(()));
    log.append(&RoutingKey::new("k"), b"first").await.unwrap();
    log.append(&RoutingKey::new("k"), b"second").await.unwrap();

    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), drain_config(false)));
    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());

    assert!(eventually(|| async { log.inner.total_pending().await == 0 }).await);
    stop(shutdown, workers).await;

    // A failed commit is retried on its own, without another delivery
    assert_eq!(downstream.payloads(), vec![b"first".to_vec(), b"second".to_vec()]);
    assert_eq!(log.commits(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_leaves_record_uncommitted() {
    let log = Arc::new(InMemoryLog::new(1));
    let downstream = ScriptedDownstream::always(Err(DeliveryFailure::Status(500)));
    log.append(&RoutingKey::new("k"), b"pending").await.unwrap();

    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), drain_config(true)));
    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());

    assert!(eventually(|| async { downstream.call_count() >= 1 }).await);
    stop(shutdown, workers).await;

    assert_eq!(downstream.call_count(), 1);
    assert_eq!(log.total_pending().await, 1);
    assert!(log.dead_letters().await.is_empty());

    // A fresh worker starts over on the same record
    let restarted = Drain::new(log.clone(), ScriptedDownstream::always(Ok(())), drain_config(true));
    let record = log.fetch(PartitionId(0)).await.unwrap().unwrap();
    assert_eq!(record.payload, b"pending");
    let outcome = restarted.process_record(&record, &CancellationToken::new()).await;
    assert_eq!(outcome, Some(RecordOutcome::Delivered { attempts: 1 }));
}

#[tokio::test(start_paused = true)]
async fn test_drain_only_touches_owned_partitions() {
    let log = Arc::new(InMemoryLog::new(4));
    let downstream = ScriptedDownstream::always(Ok(()));

    // Find two keys that land in different partitions
    let first = RoutingKey::new("owner-a");
    let owned = log.partition_of(&first);
    let other = (0..100)
        .map(|i| RoutingKey::new(format!("other-{}", i)))
        .find(|k| log.partition_of(k) != owned)
        .unwrap();
    log.append(&first, b"mine").await.unwrap();
    log.append(&other, b"theirs").await.unwrap();

    let config = DrainConfig {
        partitions: Some(vec![owned, PartitionId(99)]),
        ..drain_config(false)
    };
    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), config));
    assert_eq!(drain.owned_partitions(), vec![owned]);

    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());
    assert!(eventually(|| async { log.pending(owned).await == 0 }).await);
    tokio::time::sleep(Duration::from_secs(5)).await;
    stop(shutdown, workers).await;

    assert_eq!(downstream.payloads(), vec![b"mine".to_vec()]);
    assert_eq!(log.total_pending().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_not_blocked_by_unresponsive_broker() {
    let log = Arc::new(FlakyLog::new(2).hang_fetches());
    let downstream = ScriptedDownstream::always(Ok(()));
    log.append(&RoutingKey::new("k"), b"stuck").await.unwrap();

    let drain = Arc::new(Drain::new(log.clone(), downstream.clone(), drain_config(false)));
    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());

    // Let every worker enter its fetch
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), stop(shutdown, workers)).await;
    assert!(stopped.is_ok(), "workers stayed blocked in fetch after shutdown");
    assert_eq!(downstream.call_count(), 0);
    assert_eq!(log.inner.total_pending().await, 1);
}
