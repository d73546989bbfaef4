//! Queue tests against the sled backend
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use transfer_queue::configure::load_config_from;
use transfer_queue::{SledBackend, Transfer, TransferId, TransferQueueError, TransferQueueStore};

fn transfer(block_number: u64, log_index: u64) -> Transfer {
    Transfer {
        block_number,
        log_index,
        transaction_hash: "0xfeed".to_string(),
        from: "0xaaaa".to_string(),
        to: "0xbbbb".to_string(),
        value: "42".to_string(),
        unit: "USDT".to_string(),
    }
}

fn open_store_with_ttl(dir: &TempDir, ttl_secs: u64) -> TransferQueueStore {
    let backend = SledBackend::open(dir.path().join("queue")).unwrap();
    TransferQueueStore::new(Arc::new(backend), "usdt", ttl_secs).unwrap()
}

fn open_store(dir: &TempDir) -> TransferQueueStore {
    open_store_with_ttl(dir, 3_600)
}

#[tokio::test]
async fn test_sled_queue_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    println!("1. Admitting transfers out of order...");
    for (block, log) in [(10, 2), (10, 0), (9, 5)] {
        assert!(store.add_transfer(&transfer(block, log)).await.unwrap());
    }
    assert!(!store.add_transfer(&transfer(10, 0)).await.unwrap());
    assert_eq!(store.pending_len().await.unwrap(), 3);

    println!("2. Draining in chain order...");
    let head = store.next_transfer().await.unwrap().unwrap();
    assert_eq!(head.id(), TransferId::new(9, 5));
    assert_eq!(store.next_transfer().await.unwrap(), Some(head.clone()));

    store.remove_transfer(&head).await.unwrap();
    assert_eq!(store.next_transfer().await.unwrap().unwrap().id(), TransferId::new(10, 0));
    assert_eq!(store.transfer(&head.id()).await.unwrap(), Some(head));

    println!("3. Block number...");
    assert_eq!(store.get_pending_block_number().await.unwrap(), None);
    store.set_pending_block_number(11).await.unwrap();
    assert_eq!(store.get_pending_block_number().await.unwrap(), Some(11));
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_store(&dir);
        for (block, log) in [(21, 1), (20, 7), (21, 0)] {
            store.add_transfer(&transfer(block, log)).await.unwrap();
        }
        store.remove(&TransferId::new(20, 7)).await.unwrap();
        store.set_pending_block_number(22).await.unwrap();
        // Dropping the store closes the database
    }

    let store = open_store(&dir);
    assert_eq!(store.pending_len().await.unwrap(), 2);
    assert_eq!(store.get_pending_block_number().await.unwrap(), Some(22));
    assert_eq!(store.next_transfer().await.unwrap().unwrap().id(), TransferId::new(21, 0));
    assert_eq!(
        store.transfer(&TransferId::new(20, 7)).await.unwrap(),
        Some(transfer(20, 7))
    );
    // Removed but still recorded, so still deduplicated after reopen
    assert!(!store.add_transfer(&transfer(20, 7)).await.unwrap());
}

#[tokio::test]
async fn test_sled_entries_expire_after_ttl() {
    let dir = TempDir::new().unwrap();
    let store = open_store_with_ttl(&dir, 1);

    store.add_transfer(&transfer(5, 0)).await.unwrap();
    store.set_pending_block_number(6).await.unwrap();
    assert_eq!(store.pending_len().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(store.next_transfer().await.unwrap(), None);
    assert_eq!(store.pending_len().await.unwrap(), 0);
    assert_eq!(store.get_pending_block_number().await.unwrap(), None);
    assert_eq!(store.transfer(&TransferId::new(5, 0)).await.unwrap(), None);

    // The expired record no longer blocks admission and the queue is rebuilt
    assert!(store.add_transfer(&transfer(5, 0)).await.unwrap());
    assert_eq!(store.next_transfer().await.unwrap().unwrap().id(), TransferId::new(5, 0));
    assert_eq!(store.pending_len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_create_from_config() {
    let dir = TempDir::new().unwrap();
    let mut config = load_config_from("does/not/exist").unwrap();
    config.namespace = "cfg".to_string();
    config.db_path = dir.path().join("from_config").to_string_lossy().to_string();

    let store = TransferQueueStore::create(&config).unwrap();
    assert_eq!(store.namespace(), "cfg");
    assert_eq!(store.ttl_secs(), config.cache_ttl_secs);
    assert!(store.add_transfer(&transfer(1, 0)).await.unwrap());
}

#[tokio::test]
async fn test_create_fails_when_store_cannot_open() {
    let dir = TempDir::new().unwrap();
    // A regular file where the database directory should be
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, b"x").unwrap();

    let mut config = load_config_from("does/not/exist").unwrap();
    config.db_path = blocker.join("db").to_string_lossy().to_string();

    assert!(matches!(
        TransferQueueStore::create(&config),
        Err(TransferQueueError::Backend(_))
    ));
}
