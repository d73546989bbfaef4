//! Persisted, TTL-bounded queue of transfers awaiting publication
//!
//! Layout per namespace:
//! - `<ns>:block` holds the pending block number
//! - `<ns>:transfers` is a sorted set of encoded [`TransferId`]s, all scored 0
//! - `<ns>:tx:<id>` is a hash with the full [`Transfer`]
//!
//! Every member scores 0, so the head of the set is decided by member bytes;
//! [`TransferId::encode`] is fixed width so byte order is chain order.

use std::sync::Arc;

use log::{debug, warn};

use crate::backend::{KvBackend, SledBackend, WriteBatch};
use crate::configure::AppConfig;
use crate::transfer::error::{Result, TransferQueueError};
use crate::transfer::keys::KeySpace;
use crate::transfer::types::{Transfer, TransferId};

const QUEUE_SCORE: f64 = 0.0;

pub struct TransferQueueStore {
    backend: Arc<dyn KvBackend>,
    keys: KeySpace,
    ttl_secs: u64,
}

impl TransferQueueStore {
    /// Build a store over an already connected backend
    pub fn new(backend: Arc<dyn KvBackend>, namespace: &str, ttl_secs: u64) -> Result<Self> {
        if namespace.is_empty() {
            return Err(TransferQueueError::Config("namespace must not be empty".to_string()));
        }
        if ttl_secs == 0 {
            return Err(TransferQueueError::Config("ttl must be a positive number of seconds".to_string()));
        }
        Ok(Self {
            backend,
            keys: KeySpace::new(namespace),
            ttl_secs,
        })
    }

    /// Open the sled backend named by the config and build a store on it.
    ///
    /// Fails if the database cannot be opened.
    pub fn create(config: &AppConfig) -> Result<Self> {
        let backend = SledBackend::open(&config.db_path)?;
        Self::new(Arc::new(backend), &config.namespace, config.cache_ttl_secs)
    }

    pub fn namespace(&self) -> &str {
        self.keys.namespace()
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub async fn get_pending_block_number(&self) -> Result<Option<u64>> {
        let key = self.keys.block();
        match self.backend.get(key).await? {
            None => Ok(None),
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| TransferQueueError::InvalidBlockNumber {
                    key: key.to_string(),
                    value,
                }),
        }
    }

    /// Overwrite the pending block number and reset its TTL.
    ///
    /// Callers own forward-only progress; no monotonicity check happens here.
    pub async fn set_pending_block_number(&self, block_number: u64) -> Result<()> {
        self.backend
            .set_ex(self.keys.block(), &block_number.to_string(), self.ttl_secs)
            .await?;
        debug!("[{}] pending block number set to {}", self.namespace(), block_number);
        Ok(())
    }

    /// Admit a transfer unless its record already exists.
    ///
    /// The record write, queue insert and both TTL refreshes run as one batch
    /// guarded on the record key being absent, so concurrent producers cannot
    /// double-admit. Returns whether the transfer was newly queued.
    ///
    /// A transfer removed from the queue keeps its record until the TTL
    /// lapses, and re-adding it during that window is a no-op.
    pub async fn add_transfer(&self, transfer: &Transfer) -> Result<bool> {
        let id = transfer.id();
        let transfer_key = self.keys.transfer(&id);
        let batch = WriteBatch::new()
            .require_absent(transfer_key.as_str())
            .hset_all(transfer_key.as_str(), transfer.to_fields())
            .expire(transfer_key.as_str(), self.ttl_secs)
            .zadd(self.keys.transfers(), QUEUE_SCORE, id.encode())
            .expire(self.keys.transfers(), self.ttl_secs);

        let admitted = self.backend.exec(batch).await?;
        if admitted {
            debug!("[{}] queued transfer {} ({})", self.namespace(), id, transfer.transaction_hash);
        } else {
            debug!("[{}] transfer {} already known, skipped", self.namespace(), id);
        }
        Ok(admitted)
    }

    /// Lowest-ordered queued transfer, without removing it.
    ///
    /// A queue entry whose record has already expired is dropped from the
    /// queue and the next entry is tried. The drop is guarded on the record
    /// still being absent, so a concurrent re-admission is never lost.
    pub async fn next_transfer(&self) -> Result<Option<Transfer>> {
        loop {
            let head = self
                .backend
                .zrange_by_score(self.keys.transfers(), QUEUE_SCORE, QUEUE_SCORE, 0, 1)
                .await?;
            let Some(member) = head.into_iter().next() else {
                return Ok(None);
            };

            let id = TransferId::decode(&member)?;
            if let Some(transfer) = self.transfer(&id).await? {
                return Ok(Some(transfer));
            }

            // Only drop the member while the record is still missing; a
            // producer may have re-admitted it since the lookup above
            let cleanup = WriteBatch::new()
                .require_absent(self.keys.transfer(&id))
                .zrem(self.keys.transfers(), member.as_str());
            if self.backend.exec(cleanup).await? {
                warn!(
                    "[{}] queued transfer {} has no record (expired), dropped it from the queue",
                    self.namespace(),
                    id
                );
            } else {
                debug!("[{}] transfer {} was re-admitted, reading the head again", self.namespace(), id);
            }
        }
    }

    /// Take a transfer out of the queue. Its record is left to expire.
    pub async fn remove_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.remove(&transfer.id()).await
    }

    /// Remove by id; absent ids are a no-op
    pub async fn remove(&self, id: &TransferId) -> Result<()> {
        let removed = self.backend.zrem(self.keys.transfers(), &id.encode()).await?;
        if removed {
            debug!("[{}] removed transfer {} from queue", self.namespace(), id);
        }
        Ok(())
    }

    /// Look up a transfer record directly, queued or not
    pub async fn transfer(&self, id: &TransferId) -> Result<Option<Transfer>> {
        let key = self.keys.transfer(id);
        let fields = self.backend.hget_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Transfer::from_fields(&key, &fields).map(Some)
    }

    /// Number of transfers currently queued
    pub async fn pending_len(&self) -> Result<usize> {
        Ok(self.backend.zcard(self.keys.transfers()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MemoryBackend;

    fn transfer(block_number: u64, log_index: u64) -> Transfer {
        Transfer {
            block_number,
            log_index,
            transaction_hash: format!("0x{block_number:x}{log_index:x}"),
            from: "0xfrom".to_string(),
            to: "0xto".to_string(),
            value: "1".to_string(),
            unit: "ETH".to_string(),
        }
    }

    #[test]
    fn test_rejects_zero_ttl_and_empty_namespace() {
        let backend = Arc::new(MemoryBackend::new());
        assert!(matches!(
            TransferQueueStore::new(backend.clone(), "ns", 0),
            Err(TransferQueueError::Config(_))
        ));
        assert!(matches!(
            TransferQueueStore::new(backend, "", 60),
            Err(TransferQueueError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_add_writes_record_and_member() {
        let backend = MemoryBackend::new();
        let store = TransferQueueStore::new(Arc::new(backend.clone()), "ns", 60).unwrap();

        assert!(store.add_transfer(&transfer(5, 1)).await.unwrap());

        assert_eq!(
            backend.keys(),
            vec![
                "ns:transfers".to_string(),
                "ns:tx:00000000000000000005-00000000000000000001".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_numeric_block_number_is_reported() {
        let backend = MemoryBackend::new();
        let store = TransferQueueStore::new(Arc::new(backend.clone()), "ns", 60).unwrap();
        backend.set_ex("ns:block", "latest", 60).await.unwrap();

        assert!(matches!(
            store.get_pending_block_number().await,
            Err(TransferQueueError::InvalidBlockNumber { ref value, .. }) if value == "latest"
        ));
    }

    #[tokio::test]
    async fn test_foreign_queue_member_is_an_error() {
        let backend = MemoryBackend::new();
        let store = TransferQueueStore::new(Arc::new(backend.clone()), "ns", 60).unwrap();
        backend
            .exec(WriteBatch::new().zadd("ns:transfers", 0.0, "garbage"))
            .await
            .unwrap();

        assert!(matches!(
            store.next_transfer().await,
            Err(TransferQueueError::InvalidTransferId(_))
        ));
    }
}
