//! Building queue entries from ERC-20 `Transfer` event logs

use ethers::types::{Address, Log, H256, U256};
use ethers::utils::{keccak256, to_checksum};

use crate::transfer::error::{Result, TransferQueueError};
use crate::transfer::types::Transfer;

pub const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";

/// topic0 of every ERC-20 `Transfer` log
pub fn transfer_event_topic() -> H256 {
    H256::from(keccak256(TRANSFER_EVENT))
}

fn invalid(msg: impl Into<String>) -> TransferQueueError {
    TransferQueueError::InvalidLog(msg.into())
}

/// Indexed address topics are left-padded to 32 bytes
fn topic_address(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

impl Transfer {
    /// Convert a mined ERC-20 `Transfer` log, tagging it with `unit`.
    ///
    /// Pending logs (no block number, log index or tx hash), logs dropped by a
    /// chain reorganization (`removed: true`) and logs of any other shape are
    /// rejected.
    pub fn from_erc20_log(log: &Log, unit: &str) -> Result<Self> {
        if log.removed == Some(true) {
            return Err(invalid("log was removed by a chain reorganization"));
        }
        if log.topics.len() != 3 {
            return Err(invalid(format!("expected 3 topics, got {}", log.topics.len())));
        }
        if log.topics[0] != transfer_event_topic() {
            return Err(invalid(format!("unexpected event topic {:?}", log.topics[0])));
        }
        if log.data.len() != 32 {
            return Err(invalid(format!("expected 32 data bytes, got {}", log.data.len())));
        }

        let block_number = log
            .block_number
            .ok_or_else(|| invalid("log has no block number"))?
            .as_u64();
        let log_index = log.log_index.ok_or_else(|| invalid("log has no log index"))?;
        if log_index > U256::from(u64::MAX) {
            return Err(invalid(format!("log index {log_index} out of range")));
        }
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| invalid("log has no transaction hash"))?;

        Ok(Self {
            block_number,
            log_index: log_index.as_u64(),
            transaction_hash: format!("{transaction_hash:?}"),
            from: to_checksum(&topic_address(&log.topics[1]), None),
            to: to_checksum(&topic_address(&log.topics[2]), None),
            value: U256::from_big_endian(&log.data).to_string(),
            unit: unit.to_string(),
        })
    }
}
