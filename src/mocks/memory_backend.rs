//! In-memory KvBackend for tests and single-process use
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::entry::{self, Entry};
use crate::backend::{BackendError, BackendResult, KvBackend, WriteBatch};

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Added to wall-clock time so tests can fast-forward expiry
    clock_offset_ms: i64,
    fail_next: Option<String>,
}

impl Inner {
    fn now_ms(&self) -> i64 {
        entry::now_ms().saturating_add(self.clock_offset_ms)
    }

    fn check_fault(&mut self) -> BackendResult<()> {
        match self.fail_next.take() {
            Some(msg) => Err(BackendError::Injected(msg)),
            None => Ok(()),
        }
    }

    fn live(&mut self, key: &str) -> Option<&Entry> {
        let now = self.now_ms();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn run_batch(&mut self, batch: &WriteBatch) -> BackendResult<Option<Vec<bool>>> {
        let now = self.now_ms();
        let mut slots: HashMap<String, Option<Entry>> = batch
            .touched_keys()
            .into_iter()
            .map(|key| {
                let slot = entry::live(self.entries.get(key).cloned(), now);
                (key.to_string(), slot)
            })
            .collect();

        // Slots are copies, so a failing op leaves the stored entries untouched
        let Some(changed) = entry::apply_batch(&mut slots, batch, now)? else {
            return Ok(None);
        };
        for (key, slot) in slots {
            match slot {
                Some(e) => {
                    self.entries.insert(key, e);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(Some(changed))
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the backend clock forward
    pub fn advance(&self, by: Duration) {
        let by_ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        let mut inner = self.lock();
        inner.clock_offset_ms = inner.clock_offset_ms.saturating_add(by_ms);
    }

    /// Make the next backend call fail with an injected error
    pub fn fail_next(&self, msg: &str) {
        self.lock().fail_next = Some(msg.to_string());
    }

    /// Live keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.lock();
        let now = inner.now_ms();
        inner.entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = inner.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop a key regardless of its expiry
    pub fn delete(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut inner = self.lock();
        inner.check_fault()?;
        entry::as_string(key, inner.live(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.check_fault()?;
        inner.run_batch(&WriteBatch::new().set_ex(key, value, ttl_secs))?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        let mut inner = self.lock();
        inner.check_fault()?;
        entry::as_hash(key, inner.live(key))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> BackendResult<Vec<String>> {
        let mut inner = self.lock();
        inner.check_fault()?;
        entry::range_by_score(key, inner.live(key), min, max, offset, limit)
    }

    async fn zcard(&self, key: &str) -> BackendResult<usize> {
        let mut inner = self.lock();
        inner.check_fault()?;
        entry::zset_len(key, inner.live(key))
    }

    async fn zrem(&self, key: &str, member: &str) -> BackendResult<bool> {
        let mut inner = self.lock();
        inner.check_fault()?;
        let changed = inner.run_batch(&WriteBatch::new().zrem(key, member))?;
        Ok(changed.map_or(false, |flags| flags.iter().any(|c| *c)))
    }

    async fn exec(&self, batch: WriteBatch) -> BackendResult<bool> {
        let mut inner = self.lock();
        inner.check_fault()?;
        Ok(inner.run_batch(&batch)?.is_some())
    }
}
