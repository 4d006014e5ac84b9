//! Transaction broadcast.
//!
//! A broadcast always goes to the trusted node. Copies go to every verified untrusted node,
//! and the pool manager keeps sending the tx to new untrusted nodes until the shotgun count
//! is reached. Broadcasts that are not complete survive a restart through the event
//! dispatcher and are sent again the first time the node is ready.

use std::slice;

use crate::error::{Result, SpyNodeError};
use crate::network::constants::{READY_POLL_ATTEMPTS, READY_POLL_INTERVAL};
use crate::wire::{Hash32, NetworkMessage, Transaction};

use super::Node;
use super::core::BroadcastTx;

impl Node {
    /// Sends `tx` to the trusted node and the verified untrusted nodes.
    ///
    /// Waits up to 25 seconds for the node to be ready. Fails with
    /// [`SpyNodeError::NodeInactive`] when the node is stopping or not connected.
    pub async fn broadcast_tx(&self, tx: Transaction) -> Result<()> {
        let txid = tx.txid();
        tracing::info!(txid = %txid, "Broadcasting tx");

        for _ in 0..READY_POLL_ATTEMPTS {
            if self.is_stopping().await {
                return Err(SpyNodeError::NodeInactive);
            }
            if self.is_ready().await {
                break;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        if self.is_stopping().await {
            return Err(SpyNodeError::NodeInactive);
        }

        self.outgoing
            .add(NetworkMessage::Tx(tx.clone()))
            .await
            .map_err(|_| SpyNodeError::NodeInactive)?;

        let count = 1 + self.send_to_untrusted(&tx).await;
        self.track_broadcast(tx, count).await;
        Ok(())
    }

    /// Sends `tx` to the verified untrusted nodes only.
    pub async fn broadcast_tx_untrusted_only(&self, tx: Transaction) -> Result<()> {
        tracing::info!(txid = %tx.txid(), "Broadcasting tx to untrusted nodes only");
        if self.is_stopping().await {
            return Err(SpyNodeError::NodeInactive);
        }
        self.send_to_untrusted(&tx).await;
        Ok(())
    }

    /// True once `txid` reached enough peers, or when the node is stopping.
    pub async fn broadcast_is_complete(&self, txid: &Hash32) -> bool {
        if self.is_stopping().await {
            return true;
        }
        let broadcasts = self.broadcasts.lock().await;
        tracing::debug!("{} broadcast txs remaining", broadcasts.len());
        !broadcasts.iter().any(|broadcast| broadcast.tx.txid() == *txid)
    }

    /// Returns the number of untrusted nodes the tx was handed to.
    async fn send_to_untrusted(&self, tx: &Transaction) -> usize {
        let nodes = self.untrusted.lock().await.clone();
        let mut count = 0;
        for node in nodes {
            if !node.is_ready().await {
                continue;
            }
            match node.broadcast_txs(slice::from_ref(tx)).await {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::warn!(address = node.address(), "Failed to broadcast tx to untrusted node: {}", e)
                }
            }
        }
        count
    }

    /// Keeps the broadcast for the pool manager until the shotgun count is reached.
    async fn track_broadcast(&self, tx: Transaction, count: usize) {
        if self.config.untrusted_count == 0 || count >= self.config.shotgun_count {
            self.events.complete_pending_tx(&tx.txid()).await;
            return;
        }

        self.events.add_pending_tx(&tx).await;
        let mut broadcasts = self.broadcasts.lock().await;
        let txid = tx.txid();
        if !broadcasts.iter().any(|broadcast| broadcast.tx.txid() == txid) {
            broadcasts.push(BroadcastTx { tx, count });
        }
    }

    /// Adds `sent` peers to the tracked broadcasts of `txids` and retires the ones that
    /// reached the shotgun count.
    pub(super) async fn count_broadcasts(&self, txids: &[Hash32], sent: usize) {
        if sent == 0 || txids.is_empty() {
            return;
        }

        let completed: Vec<Hash32> = {
            let mut broadcasts = self.broadcasts.lock().await;
            let mut completed = Vec::new();
            broadcasts.retain_mut(|broadcast| {
                if !txids.contains(&broadcast.tx.txid()) {
                    return true;
                }
                broadcast.count += sent;
                if broadcast.count > self.config.shotgun_count {
                    completed.push(broadcast.tx.txid());
                    false
                } else {
                    true
                }
            });
            completed
        };

        for txid in completed {
            tracing::info!(txid = %txid, "Broadcast complete");
            self.events.complete_pending_tx(&txid).await;
        }
    }

    /// Sends the broadcasts that were not complete when the node last stopped.
    pub(super) async fn resume_broadcasts(&self) -> Vec<NetworkMessage> {
        let pending = self.events.pending_txs().await;
        if pending.is_empty() {
            return Vec::new();
        }
        tracing::info!("Resuming {} broadcasts", pending.len());

        let mut messages = Vec::with_capacity(pending.len());
        for tx in pending {
            messages.push(NetworkMessage::Tx(tx.clone()));

            let txid = tx.txid();
            let tracked = self.broadcasts.lock().await.iter().any(|broadcast| broadcast.tx.txid() == txid);
            if tracked {
                continue;
            }
            let count = 1 + self.send_to_untrusted(&tx).await;
            self.track_broadcast(tx, count).await;
        }
        messages
    }
}
