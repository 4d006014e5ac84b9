//! Bitcoin SV light node that watches the network for relevant transactions.
//!
//! The node follows one trusted full node for headers and blocks and uses a pool of
//! untrusted peers for broadcast redundancy, peer discovery and independent mempool
//! corroboration. It can:
//!
//! - Synchronize headers and download blocks from a configured start block
//! - Report transactions matching subscribed push datas or contract markers
//! - Detect double spends of unconfirmed transactions
//! - Promote unconfirmed transactions to safe after a configurable delay
//! - Build merkle proofs for confirmed transactions and handle reorgs
//! - Persist its state so it resumes after a restart without repeating notifications
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use spynode::{Config, DiskStorage, Node};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::mainnet("127.0.0.1:8333").with_storage_path("./.tmp/spynode");
//!     let storage = Arc::new(DiskStorage::new(&config.storage_path)?);
//!
//!     let node = Arc::new(Node::new(config, storage, None, None)?);
//!     node.subscribe_contracts().await;
//!     node.clone().run().await?;
//!     Ok(())
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod client;
pub mod error;
pub mod handler;
pub mod logging;
pub mod merkle;
pub mod network;
pub mod state;
pub mod storage;
pub mod wire;

pub use client::{Config, Filter, Node};
pub use error::{
    BlockError, ConfigError, LoggingError, NetworkError, Result, SpyNodeError, StorageError,
    WireError,
};
pub use handler::{
    AcceptRegister, Handler, HandlerError, Headers, MessagePayload, OutputFetcher, Tx,
    TxFetcher, TxState, TxUpdate, Utxo,
};
pub use logging::{LogFileConfig, LoggingConfig, LoggingGuard, init_console_logging, init_logging};
pub use merkle::{MerkleProof, MerkleTree};
pub use storage::{DiskStorage, MemoryStorage, Storage};
pub use tracing::level_filters::LevelFilter;
pub use wire::{Block, BlockHeader, Hash20, Hash32, Network, OutPoint, Transaction, TxOut};

/// Current version of the spynode library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
