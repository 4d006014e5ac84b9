//! Persistent state of the spynode.
//!
//! Everything is kept in a flat key-value [`Storage`] under `spynode/` keys. The
//! repositories on top of it hold in-memory working sets and write them back at explicit
//! save points.

pub mod blocks;
pub mod disk;
pub mod memory;
pub mod peers;
pub mod reorgs;
pub mod transactions;
pub mod tx_states;

use async_trait::async_trait;

use crate::error::StorageResult;

pub use blocks::BlockRepository;
pub use disk::DiskStorage;
pub use memory::MemoryStorage;
pub use peers::{Peer, PeerRepository};
pub use reorgs::{Reorg, ReorgBlock, ReorgRepository};
pub use transactions::{TxRepository, UnconfirmedGuard};
pub use tx_states::TxStateRepository;

/// Key-value storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns `StorageError::NotFound` for a missing key.
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Removing a missing key is `StorageError::NotFound`.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Reads a key, mapping a missing key to `None`.
pub(crate) async fn read_optional(store: &dyn Storage, key: &str) -> StorageResult<Option<Vec<u8>>> {
    match store.read(key).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes a key, ignoring a missing one.
pub(crate) async fn remove_if_exists(store: &dyn Storage, key: &str) -> StorageResult<()> {
    match store.remove(key).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}
