//! Core `Node` struct definition and simple accessor methods.
//!
//! This module contains:
//! - The main `Node` struct definition
//! - Stop and restart signalling shared by the connection tasks
//! - Readiness and configuration accessors

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SpyNodeError;
use crate::handler::{OutputFetcher, TxFetcher};
use crate::network::{MessageChannel, TxMessage, UntrustedContext, UntrustedNode};
use crate::state::{MemPool, SyncState, TxTracker};
use crate::storage::{
    BlockRepository, PeerRepository, ReorgRepository, Storage, TxRepository, TxStateRepository,
};
use crate::wire::{NetworkMessage, Transaction};

use super::events::EventDispatcher;
use super::filter::Filter;
use super::refeeder::BlockRefeeder;
use super::Config;

/// A transaction still being sent to untrusted peers.
#[derive(Clone, Debug)]
pub(super) struct BroadcastTx {
    pub tx: Transaction,
    /// Peers it was sent to, the trusted node included.
    pub count: usize,
}

/// Light node following one trusted peer and relaying through a pool of untrusted peers.
///
/// A `Node` is shared as `Arc<Node>`: [`run`](Node::run) drives the connection while the
/// application subscribes, queries and broadcasts through the other methods.
pub struct Node {
    pub(super) config: Config,
    pub(super) store: Arc<dyn Storage>,

    pub(super) peers: Arc<PeerRepository>,
    pub(super) blocks: Arc<BlockRepository>,
    pub(super) txs: TxRepository,
    pub(super) tx_states: TxStateRepository,
    pub(super) reorgs: ReorgRepository,

    pub(super) mempool: Arc<MemPool>,
    pub(super) tracker: TxTracker,
    pub(super) state: Mutex<SyncState>,
    pub(super) filter: RwLock<Filter>,
    pub(super) events: EventDispatcher,
    pub(super) refeeder: Mutex<BlockRefeeder>,

    pub(super) tx_fetcher: Option<Arc<dyn TxFetcher>>,
    pub(super) output_fetcher: Option<Arc<dyn OutputFetcher>>,

    pub(super) outgoing: MessageChannel<NetworkMessage>,
    pub(super) unconfirmed: Arc<MessageChannel<TxMessage>>,

    pub(super) untrusted: Mutex<Vec<Arc<UntrustedNode>>>,
    pub(super) broadcasts: Mutex<Vec<BroadcastTx>>,
    /// Last time each untrusted address was used.
    pub(super) addresses: Mutex<HashMap<String, Instant>>,

    /// Serializes block processing with header driven reverts.
    pub(super) block_lock: Mutex<()>,

    /// Cancelled to end the current connection.
    pub(super) stop_token: RwLock<CancellationToken>,
    pub(super) needs_restart: AtomicBool,
    pub(super) hard_stop: AtomicBool,
    pub(super) running: AtomicBool,
    pub(super) stopped: Notify,
    pub(super) scanning: AtomicBool,
    pub(super) attempts: AtomicU32,
    pub(super) fatal: Mutex<Option<SpyNodeError>>,
}

impl Node {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connected and caught up with the trusted node.
    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.is_ready()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(super) async fn stop_token(&self) -> CancellationToken {
        self.stop_token.read().await.clone()
    }

    pub(super) async fn is_stopping(&self) -> bool {
        self.stop_token.read().await.is_cancelled()
    }

    /// Ends the current connection.
    pub(super) async fn request_stop(&self) {
        tracing::debug!("Stop requested");
        self.stop_token.read().await.cancel();
    }

    /// Ends the current connection and connects again.
    pub(super) async fn restart(&self) {
        tracing::info!("Restarting connection to trusted node");
        self.needs_restart.store(true, Ordering::SeqCst);
        self.request_stop().await;
    }

    /// Stops the node for good, keeping the first fatal error for [`run`](Node::run).
    pub(super) async fn fail(&self, error: SpyNodeError) {
        tracing::error!("Stopping node: {}", error);
        {
            let mut fatal = self.fatal.lock().await;
            if fatal.is_none() {
                *fatal = Some(error);
            }
        }
        self.hard_stop.store(true, Ordering::SeqCst);
        self.request_stop().await;
    }

    pub(super) fn untrusted_context(&self) -> UntrustedContext {
        UntrustedContext {
            network: self.config.network,
            user_agent: self.config.user_agent.clone(),
            peers: self.peers.clone(),
            blocks: self.blocks.clone(),
            mempool: self.mempool.clone(),
            txs: self.unconfirmed.clone(),
        }
    }
}
