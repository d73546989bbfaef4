use crate::transfer::types::TransferId;

pub const KEY_SEPARATOR: &str = ":";

/// Namespaced key layout for one queue
///
/// `<ns>:block`, `<ns>:transfers` and `<ns>:tx:<encoded id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
    block_key: String,
    transfers_key: String,
}

impl KeySpace {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            block_key: join(namespace, "block"),
            transfers_key: join(namespace, "transfers"),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pending block number scalar
    pub fn block(&self) -> &str {
        &self.block_key
    }

    /// Sorted set of queued transfer ids
    pub fn transfers(&self) -> &str {
        &self.transfers_key
    }

    /// Hash holding one full transfer record
    pub fn transfer(&self, id: &TransferId) -> String {
        join(&self.namespace, &["tx", &id.encode()].join(KEY_SEPARATOR))
    }
}

fn join(namespace: &str, base_key: &str) -> String {
    [namespace, base_key].join(KEY_SEPARATOR)
}
