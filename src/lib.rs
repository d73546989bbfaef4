pub mod backend;
pub mod configure;
pub mod logger;
pub mod mocks;
pub mod transfer;

pub use backend::{BackendError, KvBackend, SledBackend, WriteBatch};
pub use transfer::{Transfer, TransferId, TransferQueueError, TransferQueueStore};
