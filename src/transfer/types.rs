//! Core types for the transfer queue
//!
//! A [`Transfer`] is one on-chain token-transfer event; its [`TransferId`] is
//! the `(block_number, log_index)` pair that fixes its place in chain order.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::transfer::error::{Result, TransferQueueError};

/// Token transfer awaiting publication
///
/// Field names serialize in camelCase, matching the hash fields persisted by
/// the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    /// Height of the block containing the event
    pub block_number: u64,
    /// Position of the event within the block's logs
    pub log_index: u64,
    pub transaction_hash: String,
    pub from: String,
    pub to: String,
    /// Decimal amount, kept as a string to avoid precision loss
    pub value: String,
    /// Token or currency unit
    pub unit: String,
}

pub(crate) const FIELD_BLOCK_NUMBER: &str = "blockNumber";
pub(crate) const FIELD_LOG_INDEX: &str = "logIndex";
pub(crate) const FIELD_TRANSACTION_HASH: &str = "transactionHash";
pub(crate) const FIELD_FROM: &str = "from";
pub(crate) const FIELD_TO: &str = "to";
pub(crate) const FIELD_VALUE: &str = "value";
pub(crate) const FIELD_UNIT: &str = "unit";

impl Transfer {
    pub fn id(&self) -> TransferId {
        TransferId::new(self.block_number, self.log_index)
    }

    /// Flatten into hash fields, every value in string form
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_BLOCK_NUMBER.to_string(), self.block_number.to_string()),
            (FIELD_LOG_INDEX.to_string(), self.log_index.to_string()),
            (FIELD_TRANSACTION_HASH.to_string(), self.transaction_hash.clone()),
            (FIELD_FROM.to_string(), self.from.clone()),
            (FIELD_TO.to_string(), self.to.clone()),
            (FIELD_VALUE.to_string(), self.value.clone()),
            (FIELD_UNIT.to_string(), self.unit.clone()),
        ]
    }

    /// Rebuild from stored hash fields.
    ///
    /// `key` is only used for error reporting. Every field is required; a
    /// partially written hash is reported as [`TransferQueueError::MalformedRecord`].
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let text = |field: &'static str| -> Result<String> {
            fields
                .get(field)
                .cloned()
                .ok_or_else(|| malformed(key, field))
        };
        let number = |field: &'static str| -> Result<u64> {
            text(field)?.parse::<u64>().map_err(|_| malformed(key, field))
        };

        Ok(Self {
            block_number: number(FIELD_BLOCK_NUMBER)?,
            log_index: number(FIELD_LOG_INDEX)?,
            transaction_hash: text(FIELD_TRANSACTION_HASH)?,
            from: text(FIELD_FROM)?,
            to: text(FIELD_TO)?,
            value: text(FIELD_VALUE)?,
            unit: text(FIELD_UNIT)?,
        })
    }
}

fn malformed(key: &str, field: &'static str) -> TransferQueueError {
    TransferQueueError::MalformedRecord {
        key: key.to_string(),
        field,
    }
}

/// Digits in `u64::MAX`
const ID_FIELD_WIDTH: usize = 20;
const ID_SEPARATOR: char = '-';

/// Chain-order key of a transfer
///
/// Ordering is by block number, then log index. The encoded form pads both
/// numbers to 20 digits so that byte-wise comparison of encodings agrees with
/// this ordering, which is what the queue's sorted set relies on: every member
/// has score 0 and ties are broken by member bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId {
    pub block_number: u64,
    pub log_index: u64,
}

impl TransferId {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }

    /// `00000000000000000009-00000000000000000005` for `(9, 5)`
    pub fn encode(&self) -> String {
        format!(
            "{:0width$}{}{:0width$}",
            self.block_number,
            ID_SEPARATOR,
            self.log_index,
            width = ID_FIELD_WIDTH
        )
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let invalid = || TransferQueueError::InvalidTransferId(encoded.to_string());
        let (block, log) = encoded.split_once(ID_SEPARATOR).ok_or_else(invalid)?;

        let parse = |part: &str| -> Result<u64> {
            if part.len() != ID_FIELD_WIDTH || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u64>().map_err(|_| invalid())
        };

        Ok(Self::new(parse(block)?, parse(log)?))
    }
}

impl From<&Transfer> for TransferId {
    fn from(transfer: &Transfer) -> Self {
        transfer.id()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for TransferId {
    type Err = TransferQueueError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transfer {
        Transfer {
            block_number: 9,
            log_index: 5,
            transaction_hash: "0xabc".to_string(),
            from: "0x01".to_string(),
            to: "0x02".to_string(),
            value: "1000000000000000000000".to_string(),
            unit: "DAI".to_string(),
        }
    }

    #[test]
    fn test_encoding_is_fixed_width() {
        assert_eq!(
            TransferId::new(9, 5).encode(),
            "00000000000000000009-00000000000000000005"
        );
        assert_eq!(TransferId::new(u64::MAX, 0).encode().len(), 41);
    }

    #[test]
    fn test_encoding_order_matches_numeric_order() {
        let mut ids = vec![
            TransferId::new(10, 2),
            TransferId::new(10, 0),
            TransferId::new(9, 5),
            TransferId::new(9, 10),
            TransferId::new(100, 1),
            TransferId::new(u64::MAX, u64::MAX),
            TransferId::new(0, 0),
        ];
        let mut encoded: Vec<String> = ids.iter().map(TransferId::encode).collect();

        ids.sort();
        encoded.sort();

        let decoded: Vec<TransferId> = encoded.iter().map(|e| TransferId::decode(e).unwrap()).collect();
        assert_eq!(decoded, ids);
        assert_eq!(ids[0], TransferId::new(0, 0));
        assert_eq!(ids[1], TransferId::new(9, 5));
        assert_eq!(ids[2], TransferId::new(9, 10));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        for bad in [
            "",
            "9-5",
            "00000000000000000009",
            "00000000000000000009:00000000000000000005",
            "+0000000000000000009-00000000000000000005",
            "00000000000000000009-0000000000000000000x",
            "99999999999999999999-00000000000000000000",
        ] {
            assert!(
                matches!(TransferId::decode(bad), Err(TransferQueueError::InvalidTransferId(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_from_str_and_display() {
        let id: TransferId = "00000000000000000042-00000000000000000007".parse().unwrap();
        assert_eq!(id, TransferId::new(42, 7));
        assert_eq!(id.to_string(), "00000000000000000042-00000000000000000007");
    }

    #[test]
    fn test_fields_roundtrip() {
        let transfer = sample();
        let fields: HashMap<String, String> = transfer.to_fields().into_iter().collect();
        assert_eq!(fields["blockNumber"], "9");
        assert_eq!(fields["value"], "1000000000000000000000");
        assert_eq!(Transfer::from_fields("k", &fields).unwrap(), transfer);
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let mut fields: HashMap<String, String> = sample().to_fields().into_iter().collect();
        fields.remove("unit");

        match Transfer::from_fields("ns:tx:1", &fields) {
            Err(TransferQueueError::MalformedRecord { key, field }) => {
                assert_eq!(key, "ns:tx:1");
                assert_eq!(field, "unit");
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_field_is_malformed() {
        let mut fields: HashMap<String, String> = sample().to_fields().into_iter().collect();
        fields.insert("logIndex".to_string(), "NaN".to_string());

        assert!(matches!(
            Transfer::from_fields("k", &fields),
            Err(TransferQueueError::MalformedRecord { field: "logIndex", .. })
        ));
    }

    #[test]
    fn test_json_uses_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["blockNumber"], 9);
        assert_eq!(json["transactionHash"], "0xabc");
    }
}
