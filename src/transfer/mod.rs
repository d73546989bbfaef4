//! Transfer queue module
//!
//! Ordered, deduplicated, TTL-bounded queue of token transfers shared by an
//! event watcher (producer) and a publisher (consumer), plus the pending block
//! number the watcher has advanced past.

pub mod erc20;
pub mod error;
pub mod keys;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TransferQueueError};
pub use keys::KeySpace;
pub use store::TransferQueueStore;
pub use types::{Transfer, TransferId};
