//! In-memory connection state, the mempool and the announced transaction tracker.

pub mod mempool;
pub mod sync_state;
pub mod tx_tracker;
pub mod untrusted_state;

pub use mempool::{AddTransaction, MemPool};
pub use sync_state::SyncState;
pub use tx_tracker::TxTracker;
pub use untrusted_state::UntrustedState;
