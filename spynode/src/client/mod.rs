//! The spynode client: the trusted connection and everything driven by it.
//!
//! The `Node` is split across files by concern:
//! - `core`: struct definition and stop signalling
//! - `lifecycle`: construction, the reconnect loop and the connection tasks
//! - `message_handler`: trusted peer messages and header sync with reorgs
//! - `block_processor`: block contents, merkle proofs and the refeeder
//! - `transactions`: unconfirmed txs, relevance and the safe delay
//! - `broadcast`: sending txs to the trusted node and the untrusted pool
//! - `untrusted_pool`: untrusted peer management and scanning
//! - `queries`: header, block and tx lookups and subscriptions

pub mod config;
pub mod filter;
pub mod refeeder;

mod block_processor;
mod broadcast;
mod core;
mod events;
mod lifecycle;
mod message_handler;
mod queries;
mod transactions;
mod untrusted_pool;

#[cfg(test)]
mod message_handler_test;
#[cfg(test)]
mod queries_test;

pub use config::Config;
pub use core::Node;
pub use filter::Filter;
pub use refeeder::BlockRefeeder;
