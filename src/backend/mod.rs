//! Backing key-value store
//!
//! The queue only needs a small Redis-like surface: string values with
//! expiry, flat hashes, sorted sets and an atomic batch of writes. Anything
//! that can offer those operations can sit behind [`KvBackend`].

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub(crate) mod entry;
pub mod sled_backend;

pub use sled_backend::SledBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to open backing store: {0}")]
    Open(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to encode/decode stored entry: {0}")]
    Codec(String),

    #[error("key {key} holds a value of the wrong type")]
    WrongType { key: String },

    #[error("injected failure: {0}")]
    Injected(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Single write inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the key with a string value expiring after `ttl_secs`
    SetEx { key: String, value: String, ttl_secs: u64 },
    /// Set every given field of a hash, creating it if needed
    HSetAll { key: String, fields: Vec<(String, String)> },
    /// Reset the expiry of an existing key; missing keys are ignored
    Expire { key: String, ttl_secs: u64 },
    /// Insert or re-score a sorted set member
    ZAdd { key: String, score: f64, member: String },
    /// Remove a sorted set member
    ZRem { key: String, member: String },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::SetEx { key, .. }
            | WriteOp::HSetAll { key, .. }
            | WriteOp::Expire { key, .. }
            | WriteOp::ZAdd { key, .. }
            | WriteOp::ZRem { key, .. } => key,
        }
    }
}

/// Ordered group of writes executed atomically by [`KvBackend::exec`].
///
/// A batch may carry a guard key: the batch only runs when that key does not
/// exist at execution time, which gives an insert-if-absent primitive without
/// a separate read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    guard: Option<String>,
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_absent(mut self, key: impl Into<String>) -> Self {
        self.guard = Some(key.into());
        self
    }

    pub fn set_ex(mut self, key: impl Into<String>, value: impl Into<String>, ttl_secs: u64) -> Self {
        self.ops.push(WriteOp::SetEx {
            key: key.into(),
            value: value.into(),
            ttl_secs,
        });
        self
    }

    pub fn hset_all(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.ops.push(WriteOp::HSetAll {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl_secs: u64) -> Self {
        self.ops.push(WriteOp::Expire {
            key: key.into(),
            ttl_secs,
        });
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> Self {
        self.ops.push(WriteOp::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(WriteOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn guard(&self) -> Option<&str> {
        self.guard.as_deref()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Every key the batch reads or writes, guard first, without duplicates
    pub fn touched_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(self.ops.len() + 1);
        for key in self.guard().into_iter().chain(self.ops.iter().map(WriteOp::key)) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// Storage operations the transfer queue relies on.
///
/// Every call completes or fails promptly; nothing blocks waiting for data.
/// Expired keys behave exactly like missing keys.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read a string value
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Overwrite a string value and reset its expiry
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> BackendResult<()>;

    /// All fields of a hash; empty when the key is missing
    async fn hget_all(&self, key: &str) -> BackendResult<HashMap<String, String>>;

    /// Members with `min <= score <= max`, ordered by score and then by member
    /// bytes, skipping `offset` and returning at most `limit`
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> BackendResult<Vec<String>>;

    async fn zcard(&self, key: &str) -> BackendResult<usize>;

    /// Remove a member; returns whether it was present
    async fn zrem(&self, key: &str, member: &str) -> BackendResult<bool>;

    /// Run a batch atomically.
    ///
    /// Returns `false` without writing anything when the batch guard key
    /// exists, `true` once every op has been applied.
    async fn exec(&self, batch: WriteBatch) -> BackendResult<bool>;
}
