//! Stored entry model shared by the embedded backends
//!
//! The in-memory backend keeps one [`Entry`] per logical key. The sled backend
//! stores strings and hashes the same way but spreads sorted sets over one
//! sled key per member. Both apply [`WriteOp`]s with the same Redis-like
//! semantics.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{BackendError, BackendResult, WriteBatch, WriteOp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    ZSet(BTreeMap<String, f64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Entry {
    pub value: Value,
    /// Absolute expiry, milliseconds since epoch
    pub expires_at_ms: Option<i64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now_ms)
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn expiry_at(now_ms: i64, ttl_secs: u64) -> i64 {
    let ttl_ms = i64::try_from(ttl_secs).unwrap_or(i64::MAX).saturating_mul(1000);
    now_ms.saturating_add(ttl_ms)
}

/// Drop the entry if it has expired
pub(crate) fn live(entry: Option<Entry>, now_ms: i64) -> Option<Entry> {
    entry.filter(|e| e.is_live(now_ms))
}

pub(crate) fn as_string(key: &str, entry: Option<&Entry>) -> BackendResult<Option<String>> {
    match entry.map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.clone())),
        Some(_) => Err(wrong_type(key)),
    }
}

pub(crate) fn as_hash(key: &str, entry: Option<&Entry>) -> BackendResult<HashMap<String, String>> {
    match entry.map(|e| &e.value) {
        None => Ok(HashMap::new()),
        Some(Value::Hash(fields)) => Ok(fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Some(_) => Err(wrong_type(key)),
    }
}

pub(crate) fn zset_len(key: &str, entry: Option<&Entry>) -> BackendResult<usize> {
    match entry.map(|e| &e.value) {
        None => Ok(0),
        Some(Value::ZSet(members)) => Ok(members.len()),
        Some(_) => Err(wrong_type(key)),
    }
}

pub(crate) fn range_by_score(
    key: &str,
    entry: Option<&Entry>,
    min: f64,
    max: f64,
    offset: usize,
    limit: usize,
) -> BackendResult<Vec<String>> {
    let members = match entry.map(|e| &e.value) {
        None => return Ok(Vec::new()),
        Some(Value::ZSet(members)) => members,
        Some(_) => return Err(wrong_type(key)),
    };

    // BTreeMap iteration is already in member byte order, so a stable sort on
    // score keeps ties ordered by member.
    let mut hits: Vec<(&String, f64)> = members
        .iter()
        .filter(|(_, score)| **score >= min && **score <= max)
        .map(|(member, score)| (member, *score))
        .collect();
    hits.sort_by(|a, b| a.1.total_cmp(&b.1));

    Ok(hits
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|(member, _)| member.clone())
        .collect())
}

/// Apply one op to the (already expiry-filtered) slot of its key.
///
/// Returns whether the op changed anything.
pub(crate) fn apply(slot: &mut Option<Entry>, op: &WriteOp, now_ms: i64) -> BackendResult<bool> {
    match op {
        WriteOp::SetEx { value, ttl_secs, .. } => {
            *slot = Some(Entry {
                value: Value::Str(value.clone()),
                expires_at_ms: Some(expiry_at(now_ms, *ttl_secs)),
            });
            Ok(true)
        }
        WriteOp::HSetAll { key, fields } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(BTreeMap::new())));
            match &mut entry.value {
                Value::Hash(hash) => {
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                    Ok(true)
                }
                _ => Err(wrong_type(key)),
            }
        }
        WriteOp::Expire { ttl_secs, .. } => match slot {
            Some(entry) => {
                entry.expires_at_ms = Some(expiry_at(now_ms, *ttl_secs));
                Ok(true)
            }
            None => Ok(false),
        },
        WriteOp::ZAdd { key, score, member } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::ZSet(BTreeMap::new())));
            match &mut entry.value {
                Value::ZSet(members) => Ok(members.insert(member.clone(), *score) != Some(*score)),
                _ => Err(wrong_type(key)),
            }
        }
        WriteOp::ZRem { key, member } => {
            let Some(entry) = slot.as_mut() else {
                return Ok(false);
            };
            let (removed, now_empty) = match &mut entry.value {
                Value::ZSet(members) => (members.remove(member).is_some(), members.is_empty()),
                _ => return Err(wrong_type(key)),
            };
            if now_empty {
                *slot = None;
            }
            Ok(removed)
        }
    }
}

/// Apply a whole batch against pre-loaded slots.
///
/// `slots` must hold every key from [`WriteBatch::touched_keys`], already
/// filtered for expiry. Returns `None` when the guard blocked the batch,
/// otherwise the per-op change flags. On error the slots may be partially
/// updated and must be discarded by the caller.
pub(crate) fn apply_batch(
    slots: &mut HashMap<String, Option<Entry>>,
    batch: &WriteBatch,
    now_ms: i64,
) -> BackendResult<Option<Vec<bool>>> {
    if let Some(guard) = batch.guard() {
        if matches!(slots.get(guard), Some(Some(_))) {
            return Ok(None);
        }
    }

    let mut changed = Vec::with_capacity(batch.ops().len());
    for op in batch.ops() {
        let slot = slots.entry(op.key().to_string()).or_insert(None);
        changed.push(apply(slot, op, now_ms)?);
    }
    Ok(Some(changed))
}

pub(crate) fn wrong_type(key: &str) -> BackendError {
    BackendError::WrongType {
        key: key.to_string(),
    }
}
