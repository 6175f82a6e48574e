//! End-to-end tests for the message store: append, pull, key lookup,
//! restart and crash recovery, retention.

use quiver_store::{
    FlushMode, GetMessageStatus, MessageStore, NewMessage, PutStatus, StoreConfig, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::compact(dir.path())
        .with_commit_log_segment_size(8 * 1024)
        .with_consume_queue_entries_per_file(64)
        .with_max_message_size(2048)
}

async fn wait_dispatched(store: &MessageStore, offset: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while store.dispatched_offset() < offset {
        assert!(
            tokio::time::Instant::now() < deadline,
            "dispatch stuck at {} waiting for {}",
            store.dispatched_offset(),
            offset
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn put_batch(store: &Arc<MessageStore>, topic: &str, queues: u32, count: usize) -> u64 {
    let mut end = 0;
    for i in 0..count {
        let msg = NewMessage::new(topic, i as u32 % queues, format!("{}-{:04}", topic, i))
            .with_keys(format!("order-{}", i))
            .with_tags(if i % 2 == 0 { "even" } else { "odd" });
        let result = store.put_message(msg).await.unwrap();
        assert_eq!(result.status, PutStatus::PutOk);
        end = result.append.unwrap().end_offset();
    }
    end
}

#[tokio::test]
async fn test_pull_across_segment_rolls() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(small_config(&dir)).await.unwrap();

    let end = put_batch(&store, "orders", 4, 400).await;
    wait_dispatched(&store, end).await;
    assert!(store.stats().max_physical_offset > 8 * 1024);

    for queue_id in 0..4 {
        assert_eq!(store.max_offset_in_queue("orders", queue_id), 100);
        let mut offset = 0;
        let mut bodies = Vec::new();
        loop {
            let got = store
                .get_message("orders", queue_id, offset, 32, usize::MAX, None)
                .unwrap();
            if got.status == GetMessageStatus::NoNewMsg {
                break;
            }
            assert_eq!(got.status, GetMessageStatus::Found);
            for msg in &got.messages {
                assert_eq!(msg.queue_id, queue_id);
                assert_eq!(msg.queue_offset, bodies.len() as u64);
                bodies.push(msg.body.clone());
            }
            offset = got.next_begin_offset;
        }
        assert_eq!(bodies.len(), 100);
        let expected = format!("orders-{:04}", queue_id);
        assert_eq!(&bodies[0][..], expected.as_bytes());
    }

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_query_by_key() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(small_config(&dir)).await.unwrap();

    let end = put_batch(&store, "orders", 2, 50).await;
    wait_dispatched(&store, end).await;

    let found = store
        .query_by_key("orders", "order-17", 8, 0, i64::MAX)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(&found[0].body[..], b"orders-0017");
    assert_eq!(found[0].keys().collect::<Vec<_>>(), vec!["order-17"]);

    assert!(store
        .query_by_key("payments", "order-17", 8, 0, i64::MAX)
        .unwrap()
        .is_empty());
    assert!(store
        .query_by_key("orders", "order-17", 8, 0, 1)
        .unwrap()
        .is_empty());

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_restart_continues_queues() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let end = {
        let store = MessageStore::open(small_config(&dir)).await.unwrap();
        let end = put_batch(&store, "orders", 1, 30).await;
        store.shutdown().await.unwrap();
        end
    };
    assert!(!dir.path().join("abort").exists());

    let store = MessageStore::open(small_config(&dir)).await.unwrap();
    assert_eq!(store.max_physical_offset(), end);
    assert_eq!(store.dispatched_offset(), end);
    assert_eq!(store.max_offset_in_queue("orders", 0), 30);

    let result = store
        .put_message(NewMessage::new("orders", 0, &b"after restart"[..]))
        .await
        .unwrap();
    assert_eq!(result.append.unwrap().queue_offset, 30);
    wait_dispatched(&store, result.append.unwrap().end_offset()).await;

    let got = store
        .get_message("orders", 0, 30, 1, usize::MAX, None)
        .unwrap();
    assert_eq!(&got.messages[0].body[..], b"after restart");
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crash_recovery_truncates_torn_tail() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let end = {
        let store = MessageStore::open(small_config(&dir)).await.unwrap();
        let end = put_batch(&store, "orders", 2, 20).await;
        store.flush().await.unwrap();
        end
        // dropped without shutdown
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dir.path().join("abort").exists());

    // a torn record after the valid tail
    let segment = dir.path().join("commitlog").join(format!("{:020}", 0));
    let mut raw = std::fs::read(&segment).unwrap();
    let at = end as usize;
    raw[at..at + 8].copy_from_slice(&[0, 0, 1, 0, 0xDA, 0xA3, 0x20, 0xA7]);
    raw[at + 8..at + 64].fill(0x5A);
    std::fs::write(&segment, &raw).unwrap();

    let store = MessageStore::open(small_config(&dir)).await.unwrap();
    assert_eq!(store.max_physical_offset(), end);
    assert_eq!(store.max_offset_in_queue("orders", 0), 10);
    assert_eq!(store.max_offset_in_queue("orders", 1), 10);

    let got = store
        .get_message("orders", 1, 0, 32, usize::MAX, None)
        .unwrap();
    assert_eq!(got.messages.len(), 10);
    assert_eq!(
        store
            .query_by_key("orders", "order-19", 4, 0, i64::MAX)
            .unwrap()
            .len(),
        1
    );

    let result = store
        .put_message(NewMessage::new("orders", 0, &b"next"[..]))
        .await
        .unwrap();
    let append = result.append.unwrap();
    assert_eq!(append.physical_offset, end);
    assert_eq!(append.queue_offset, 10);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_open_is_rejected() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(small_config(&dir)).await.unwrap();

    let err = MessageStore::open(small_config(&dir)).await.unwrap_err();
    assert!(matches!(err, StoreError::StoreLocked(_)));

    store.shutdown().await.unwrap();
    let reopened = MessageStore::open(small_config(&dir)).await.unwrap();
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retention_advances_minimums() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir)
        .with_file_reserved_time(Duration::ZERO)
        .with_cleanup_interval(Duration::from_secs(3600));
    let store = MessageStore::open(config).await.unwrap();

    let end = put_batch(&store, "orders", 1, 300).await;
    wait_dispatched(&store, end).await;

    let reclaimed = store.reclaim_expired().unwrap();
    assert!(reclaimed > 0);
    let min_physical = store.min_physical_offset();
    assert!(min_physical > 0);
    assert_eq!(min_physical % (8 * 1024), 0);

    let min_logical = store.min_offset_in_queue("orders", 0);
    assert!(min_logical > 0);
    let got = store
        .get_message("orders", 0, 0, 1, usize::MAX, None)
        .unwrap();
    assert_eq!(got.status, GetMessageStatus::OffsetIllegal);
    assert_eq!(got.next_begin_offset, min_logical);

    let got = store
        .get_message("orders", 0, min_logical, 1, usize::MAX, None)
        .unwrap();
    assert_eq!(got.status, GetMessageStatus::Found);
    assert!(got.messages[0].physical_offset >= min_physical);
    assert_eq!(store.stats().reclaimed_segments, reclaimed as u64);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sync_flush_mode() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(small_config(&dir).with_flush_mode(FlushMode::Sync))
        .await
        .unwrap();

    for i in 0..10 {
        let result = store
            .put_message(NewMessage::new("orders", 0, format!("sync-{}", i)))
            .await
            .unwrap();
        assert_eq!(result.status, PutStatus::PutOk);
        assert!(store.flushed_offset() >= result.append.unwrap().end_offset());
    }
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_and_invalid_messages() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = MessageStore::open(small_config(&dir)).await.unwrap();

    let err = store
        .put_message(NewMessage::new("orders", 0, vec![0u8; 4096]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MessageTooLarge { .. }));

    let err = store
        .put_message(NewMessage::new("bad topic!", 0, &b"x"[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidMessage(_)));

    assert_eq!(store.stats().put_failures, 2);
    assert_eq!(store.max_physical_offset(), 0);
    store.shutdown().await.unwrap();
}
