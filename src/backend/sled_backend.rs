use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, IVec};

use super::entry::{self, wrong_type, Entry};
use super::{BackendError, BackendResult, KvBackend, WriteBatch, WriteOp};

// Layout of the sled keyspace:
//   k 0x00 <key>                                -> Record (JSON)
//   m 0x00 <key> 0x00 <gen:8> <score:8> <member> -> empty
//   i 0x00 <key> 0x00 <gen:8> <member>           -> score:8
// Logical keys must not contain NUL bytes.
const RECORD_TAG: u8 = b'k';
const MEMBER_TAG: u8 = b'm';
const INDEX_TAG: u8 = b'i';
const SEP: u8 = 0;

type TxResult<T> = Result<T, ConflictableTransactionError<BackendError>>;

/// Sorted set metadata; the members themselves live under their own keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ZSetHeader {
    /// Fresh per incarnation of the set, so members of an expired or
    /// overwritten set never leak into a new one
    generation: u64,
    len: u64,
    expires_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Record {
    Plain(Entry),
    ZSet(ZSetHeader),
}

impl Record {
    fn is_live(&self, now_ms: i64) -> bool {
        match self {
            Record::Plain(plain) => plain.is_live(now_ms),
            Record::ZSet(header) => header.expires_at_ms.map_or(true, |at| at > now_ms),
        }
    }

    fn encode(&self) -> BackendResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BackendError::Codec(e.to_string()))
    }

    fn decode(raw: &[u8]) -> BackendResult<Self> {
        serde_json::from_slice(raw).map_err(|e| BackendError::Codec(e.to_string()))
    }
}

fn record_key(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 2);
    out.extend_from_slice(&[RECORD_TAG, SEP]);
    out.extend_from_slice(key.as_bytes());
    out
}

fn set_prefix(tag: u8, key: &str, generation: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 11);
    out.extend_from_slice(&[tag, SEP]);
    out.extend_from_slice(key.as_bytes());
    out.push(SEP);
    out.extend_from_slice(&generation.to_be_bytes());
    out
}

fn member_key(key: &str, generation: u64, score: [u8; 8], member: &str) -> Vec<u8> {
    let mut out = set_prefix(MEMBER_TAG, key, generation);
    out.extend_from_slice(&score);
    out.extend_from_slice(member.as_bytes());
    out
}

fn index_key(key: &str, generation: u64, member: &str) -> Vec<u8> {
    let mut out = set_prefix(INDEX_TAG, key, generation);
    out.extend_from_slice(member.as_bytes());
    out
}

/// Big-endian bytes whose lexicographic order matches the numeric order of
/// the score
fn score_bytes(score: f64) -> [u8; 8] {
    // -0.0 and 0.0 are the same score
    let score = if score == 0.0 { 0.0 } else { score };
    let bits = score.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    ordered.to_be_bytes()
}

fn score_from_bytes(bytes: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered >> 63 == 1 { ordered & !(1 << 63) } else { !ordered };
    f64::from_bits(bits)
}

fn score_array(raw: &[u8]) -> BackendResult<[u8; 8]> {
    raw.try_into()
        .map_err(|_| BackendError::Codec(format!("score must be 8 bytes, got {}", raw.len())))
}

/// Split `<score:8><member>` off a member key
fn split_member(tail: &[u8]) -> BackendResult<(f64, String)> {
    if tail.len() < 8 {
        return Err(BackendError::Codec("truncated sorted set member key".to_string()));
    }
    let (score, member) = tail.split_at(8);
    let member = String::from_utf8(member.to_vec()).map_err(|e| BackendError::Codec(e.to_string()))?;
    Ok((score_from_bytes(score_array(score)?), member))
}

/// Parse `<key> 0x00 <gen:8>` at the start of a member or index key
fn parse_set_key(tail: &[u8]) -> BackendResult<(&str, u64)> {
    let malformed = || BackendError::Codec("malformed sorted set key".to_string());
    let sep = tail.iter().position(|b| *b == SEP).ok_or_else(malformed)?;
    let key = std::str::from_utf8(&tail[..sep]).map_err(|_| malformed())?;
    let generation = tail
        .get(sep + 1..sep + 9)
        .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
        .ok_or_else(malformed)?;
    Ok((key, u64::from_be_bytes(generation)))
}

fn abort(e: BackendError) -> ConflictableTransactionError<BackendError> {
    ConflictableTransactionError::Abort(e)
}

fn load_tx(tx: &TransactionalTree, key: &str) -> TxResult<Option<Record>> {
    let raw: Option<IVec> = tx.get(record_key(key))?;
    raw.as_deref().map(Record::decode).transpose().map_err(abort)
}

/// Apply one op inside a transaction. Sorted set members are written
/// straight to `tx`; the record of the key is left in `slot`.
fn apply_op(
    tx: &TransactionalTree,
    slot: &mut Option<Record>,
    op: &WriteOp,
    now_ms: i64,
    fresh_generation: u64,
) -> TxResult<bool> {
    match op {
        WriteOp::ZAdd { key, score, member } => {
            if score.is_nan() {
                return Err(abort(BackendError::Codec(format!("NaN score for {key}"))));
            }
            let created = Record::ZSet(ZSetHeader {
                generation: fresh_generation,
                len: 0,
                expires_at_ms: None,
            });
            let header = match slot.get_or_insert(created) {
                Record::ZSet(header) => header,
                Record::Plain(_) => return Err(abort(wrong_type(key))),
            };

            let index = index_key(key, header.generation, member);
            let new_score = score_bytes(*score);
            match tx.get(&index)? {
                Some(old) if old[..] == new_score[..] => return Ok(false),
                Some(old) => {
                    let old_score = score_array(&old).map_err(abort)?;
                    tx.remove(member_key(key, header.generation, old_score, member))?;
                }
                None => header.len += 1,
            }
            tx.insert(member_key(key, header.generation, new_score, member), Vec::<u8>::new())?;
            tx.insert(index, new_score.to_vec())?;
            Ok(true)
        }
        WriteOp::ZRem { key, member } => {
            let header = match slot {
                None => return Ok(false),
                Some(Record::ZSet(header)) => header,
                Some(Record::Plain(_)) => return Err(abort(wrong_type(key))),
            };

            let index = index_key(key, header.generation, member);
            let Some(old) = tx.get(&index)? else {
                return Ok(false);
            };
            let old_score = score_array(&old).map_err(abort)?;
            tx.remove(member_key(key, header.generation, old_score, member))?;
            tx.remove(index)?;
            header.len = header.len.saturating_sub(1);
            if header.len == 0 {
                *slot = None;
            }
            Ok(true)
        }
        WriteOp::Expire { ttl_secs, .. } => match slot {
            None => Ok(false),
            Some(Record::ZSet(header)) => {
                header.expires_at_ms = Some(entry::expiry_at(now_ms, *ttl_secs));
                Ok(true)
            }
            Some(Record::Plain(plain)) => {
                plain.expires_at_ms = Some(entry::expiry_at(now_ms, *ttl_secs));
                Ok(true)
            }
        },
        WriteOp::SetEx { .. } | WriteOp::HSetAll { .. } => {
            let mut plain = match slot.take() {
                None => None,
                Some(Record::Plain(plain)) => Some(plain),
                // SET replaces any type; the old members are swept by purge_expired
                Some(Record::ZSet(_)) if matches!(op, WriteOp::SetEx { .. }) => None,
                Some(Record::ZSet(_)) => return Err(abort(wrong_type(op.key()))),
            };
            let changed = entry::apply(&mut plain, op, now_ms).map_err(abort)?;
            *slot = plain.map(Record::Plain);
            Ok(changed)
        }
    }
}

fn finish<T>(result: Result<T, TransactionError<BackendError>>) -> BackendResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(storage(e)),
    }
}

fn storage(e: sled::Error) -> BackendError {
    BackendError::Storage(e.to_string())
}

/// Embedded [`KvBackend`] on top of sled.
///
/// Strings and hashes are one JSON record per logical key. A sorted set is a
/// small header record plus one sled key per member, laid out so that sled's
/// key order is (score, member) order; reading the head of a set is a single
/// range seek however large the set grows.
///
/// Expiry is lazy: expired keys read as missing and are dropped on the next
/// write that touches them or by [`SledBackend::purge_expired`].
pub struct SledBackend {
    db: Db,
}

impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| BackendError::Open(format!("{}: {}", path.display(), e)))?;
        log::info!("opened sled backend at {}", path.display());
        Ok(Self { db })
    }

    /// Remove every expired key, returning how many were dropped.
    ///
    /// Members left behind by expired or overwritten sorted sets are swept in
    /// the same pass.
    pub fn purge_expired(&self) -> BackendResult<usize> {
        let now = entry::now_ms();
        let mut purged = 0;
        for item in self.db.scan_prefix([RECORD_TAG, SEP]) {
            let (key, raw) = item.map_err(storage)?;
            if Record::decode(&raw)?.is_live(now) {
                continue;
            }
            // Only delete if nobody rewrote the key in the meantime
            let swapped = self
                .db
                .compare_and_swap(&key, Some(&raw), None as Option<&[u8]>)
                .map_err(storage)?;
            if swapped.is_ok() {
                purged += 1;
            }
        }

        let swept = self.sweep_orphans(MEMBER_TAG, now)? + self.sweep_orphans(INDEX_TAG, now)?;
        if purged > 0 || swept > 0 {
            self.db.flush().map_err(storage)?;
        }
        log::debug!("purged {} expired keys, swept {} orphaned set entries", purged, swept);
        Ok(purged)
    }

    /// Drop member/index entries whose set is gone or has a newer generation
    fn sweep_orphans(&self, tag: u8, now: i64) -> BackendResult<usize> {
        let mut swept = 0;
        for item in self.db.scan_prefix([tag, SEP]) {
            let (raw_key, _) = item.map_err(storage)?;
            let (key, generation) = parse_set_key(&raw_key[2..])?;
            let removed = finish(self.db.transaction(|tx: &TransactionalTree| -> TxResult<bool> {
                match load_tx(tx, key)?.filter(|r| r.is_live(now)) {
                    Some(Record::ZSet(header)) if header.generation == generation => Ok(false),
                    _ => {
                        tx.remove(raw_key.clone())?;
                        Ok(true)
                    }
                }
            }))?;
            if removed {
                swept += 1;
            }
        }
        Ok(swept)
    }

    fn load(&self, key: &str) -> BackendResult<Option<Record>> {
        let raw = self.db.get(record_key(key)).map_err(storage)?;
        let record = raw.as_deref().map(Record::decode).transpose()?;
        let now = entry::now_ms();
        Ok(record.filter(|r| r.is_live(now)))
    }

    fn load_plain(&self, key: &str) -> BackendResult<Option<Entry>> {
        match self.load(key)? {
            None => Ok(None),
            Some(Record::Plain(plain)) => Ok(Some(plain)),
            Some(Record::ZSet(_)) => Err(wrong_type(key)),
        }
    }

    fn load_zset(&self, key: &str) -> BackendResult<Option<ZSetHeader>> {
        match self.load(key)? {
            None => Ok(None),
            Some(Record::ZSet(header)) => Ok(Some(header)),
            Some(Record::Plain(_)) => Err(wrong_type(key)),
        }
    }

    /// Load, apply and write back a batch inside one sled transaction
    fn run_batch(&self, batch: &WriteBatch) -> BackendResult<Option<Vec<bool>>> {
        let now = entry::now_ms();
        let keys = batch.touched_keys();
        let fresh_generation = if batch.ops().iter().any(|op| matches!(op, WriteOp::ZAdd { .. })) {
            self.db.generate_id().map_err(storage)?
        } else {
            0
        };

        finish(self.db.transaction(|tx: &TransactionalTree| -> TxResult<Option<Vec<bool>>> {
            let mut slots: HashMap<&str, Option<Record>> = HashMap::with_capacity(keys.len());
            for key in &keys {
                let loaded = load_tx(tx, key)?;
                slots.insert(*key, loaded.filter(|r| r.is_live(now)));
            }

            if let Some(guard) = batch.guard() {
                if matches!(slots.get(guard), Some(Some(_))) {
                    return Ok(None);
                }
            }

            let mut changed = Vec::with_capacity(batch.ops().len());
            for op in batch.ops() {
                let slot = slots.entry(op.key()).or_insert(None);
                changed.push(apply_op(tx, slot, op, now, fresh_generation)?);
            }

            for (key, slot) in &slots {
                match slot {
                    Some(record) => {
                        tx.insert(record_key(key), record.encode().map_err(abort)?)?;
                    }
                    None => {
                        tx.remove(record_key(key))?;
                    }
                }
            }
            Ok(Some(changed))
        }))
    }
}

#[async_trait]
impl KvBackend for SledBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        entry::as_string(key, self.load_plain(key)?.as_ref())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> BackendResult<()> {
        self.exec(WriteBatch::new().set_ex(key, value, ttl_secs)).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> BackendResult<HashMap<String, String>> {
        entry::as_hash(key, self.load_plain(key)?.as_ref())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> BackendResult<Vec<String>> {
        let mut out = Vec::new();
        if limit == 0 || min > max {
            return Ok(out);
        }
        let Some(header) = self.load_zset(key)? else {
            return Ok(out);
        };

        let prefix = set_prefix(MEMBER_TAG, key, header.generation);
        let mut start = prefix.clone();
        start.extend_from_slice(&score_bytes(min));

        let mut skipped = 0;
        for item in self.db.range(start..) {
            let (raw_key, _) = item.map_err(storage)?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let (score, member) = split_member(&raw_key[prefix.len()..])?;
            if score > max {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(member);
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    async fn zcard(&self, key: &str) -> BackendResult<usize> {
        Ok(self
            .load_zset(key)?
            .map_or(0, |header| usize::try_from(header.len).unwrap_or(usize::MAX)))
    }

    async fn zrem(&self, key: &str, member: &str) -> BackendResult<bool> {
        let changed = self.run_batch(&WriteBatch::new().zrem(key, member))?;
        self.db.flush_async().await.map_err(storage)?;
        Ok(changed.map_or(false, |flags| flags.iter().any(|c| *c)))
    }

    async fn exec(&self, batch: WriteBatch) -> BackendResult<bool> {
        if batch.is_empty() && batch.guard().is_none() {
            return Ok(true);
        }
        let applied = self.run_batch(&batch)?.is_some();
        if applied {
            self.db.flush_async().await.map_err(storage)?;
        }
        Ok(applied)
    }
}
