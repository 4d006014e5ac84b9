//! Untrusted peer pool.
//!
//! This module contains:
//! - The pool manager, which keeps the configured number of untrusted nodes connected and
//!   raises the target to the shotgun count while broadcasts are pending
//! - Scanning, which briefly connects to many unchecked peers to score them
//! - Peer administration for applications

use std::sync::Arc;
use std::sync::atomic::Ordering;

use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SpyNodeError};
use crate::network::UntrustedNode;
use crate::network::constants::{
    ADDRESS_REUSE, HIGH_SCORE, LOW_SCORE, POOL_INTERVAL, POOL_NOT_READY_DELAY, SCAN_CONNECTIONS,
    SCAN_WAIT,
};
use crate::wire::{Hash32, Transaction};

use super::Node;

type NodeTasks = JoinSet<Arc<UntrustedNode>>;

impl Node {
    /// Runs the untrusted pool until the connection ends, then stops every untrusted node.
    pub(super) async fn monitor_untrusted_nodes(&self) {
        let token = self.stop_token().await;
        let mut tasks = NodeTasks::new();

        while !token.is_cancelled() {
            self.reap_untrusted_nodes(&mut tasks).await;

            if !self.is_ready().await {
                sleep_until_stop(&token, POOL_NOT_READY_DELAY).await;
                continue;
            }

            if self.broadcasts.lock().await.is_empty() {
                self.scan_peers(&token, SCAN_CONNECTIONS, 1).await;
            }
            if token.is_cancelled() {
                break;
            }

            self.fill_pool(&token, &mut tasks).await;
            sleep_until_stop(&token, POOL_INTERVAL).await;
        }

        let nodes = std::mem::take(&mut *self.untrusted.lock().await);
        tracing::debug!("Stopping {} untrusted nodes", nodes.len());
        for node in &nodes {
            node.stop();
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Removes nodes whose connection ended.
    async fn reap_untrusted_nodes(&self, tasks: &mut NodeTasks) {
        while let Some(result) = tasks.try_join_next() {
            match result {
                Ok(node) => {
                    self.untrusted.lock().await.retain(|other| !Arc::ptr_eq(other, &node));
                }
                Err(e) => tracing::warn!("Untrusted node task failed: {}", e),
            }
        }
    }

    async fn fill_pool(&self, token: &CancellationToken, tasks: &mut NodeTasks) {
        let (mut count, verified) = {
            let nodes = self.untrusted.lock().await;
            let mut verified = 0;
            for node in nodes.iter() {
                if node.is_ready().await {
                    verified += 1;
                }
            }
            (nodes.len(), verified)
        };

        let txs: Vec<Transaction> =
            self.broadcasts.lock().await.iter().map(|broadcast| broadcast.tx.clone()).collect();
        let desired = if txs.is_empty() {
            self.config.untrusted_count
        } else {
            self.config.shotgun_count
        };
        if verified < desired {
            tracing::debug!("Untrusted connections: {} verified of {}", verified, count);
        }

        let mut sent = 0;
        while !token.is_cancelled() && count < desired / 2 {
            if !self.add_untrusted_node(tasks, HIGH_SCORE, &txs).await {
                break;
            }
            count += 1;
            sent += 1;
        }
        while !token.is_cancelled() && count < desired {
            if !self.add_untrusted_node(tasks, LOW_SCORE, &txs).await {
                break;
            }
            count += 1;
            sent += 1;
        }

        if !txs.is_empty() {
            let txids: Vec<Hash32> = txs.iter().map(Transaction::txid).collect();
            self.count_broadcasts(&txids, sent).await;
        }
    }

    /// Connects to a random peer with at least `min_score` that was not used recently.
    /// Returns false when no such peer exists.
    async fn add_untrusted_node(
        &self,
        tasks: &mut NodeTasks,
        min_score: i32,
        txs: &[Transaction],
    ) -> bool {
        let mut peers = self.peers.get(min_score).await;
        tracing::trace!("Found {} peers with score {}", peers.len(), min_score);

        let address = loop {
            if peers.is_empty() || self.is_stopping().await {
                return false;
            }
            let peer = peers.swap_remove(random_index(peers.len()));
            if self.check_address(&peer.address).await {
                break peer.address;
            }
        };

        let node = Arc::new(UntrustedNode::new(address, self.untrusted_context(), false));
        if let Err(e) = node.broadcast_txs(txs).await {
            tracing::debug!(address = node.address(), "Failed to queue broadcasts: {}", e);
        }
        self.untrusted.lock().await.push(node.clone());

        tasks.spawn(async move {
            if let Err(e) = node.clone().run().await {
                tracing::debug!(address = node.address(), "Untrusted node failed: {}", e);
            }
            node
        });
        true
    }

    /// True when `address` was not used within the reuse window. Marks it used.
    pub(super) async fn check_address(&self, address: &str) -> bool {
        let mut addresses = self.addresses.lock().await;
        let now = Instant::now();
        if let Some(last_used) = addresses.get(address) {
            if now.duration_since(*last_used) <= ADDRESS_REUSE {
                return false;
            }
        }
        addresses.insert(address.to_string(), now);
        true
    }

    /// Connects to up to `connections` unchecked peers at once, waits for their handshakes
    /// and disconnects. Skipped unless at least `min_unchecked` peers are unchecked.
    async fn scan_peers(&self, token: &CancellationToken, connections: usize, min_unchecked: usize) {
        if self.scanning.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut peers = self.peers.get_unchecked().await;
        if peers.len() < min_unchecked {
            self.scanning.store(false, Ordering::SeqCst);
            return;
        }
        tracing::debug!("Scanning {} of {} unchecked peers", connections.min(peers.len()), peers.len());

        let mut tasks = JoinSet::new();
        let mut nodes = Vec::new();
        while !token.is_cancelled() && nodes.len() < connections && !peers.is_empty() {
            let peer = peers.swap_remove(random_index(peers.len()));
            let node = Arc::new(UntrustedNode::new(peer.address, self.untrusted_context(), true));
            nodes.push(node.clone());
            tasks.spawn(async move { node.run().await });
        }

        sleep_until_stop(token, SCAN_WAIT).await;

        for node in &nodes {
            node.stop();
        }
        while tasks.join_next().await.is_some() {}

        self.scanning.store(false, Ordering::SeqCst);
        tracing::debug!("Finished scanning");
    }

    /// Scores unchecked peers by connecting to up to `connections` of them.
    pub async fn scan(&self, connections: usize) -> Result<()> {
        if !self.is_running() {
            self.peers.load().await?;
        }
        let token = self.stop_token().await;
        self.scan_peers(&token, connections, 1).await;
        self.peers.save().await?;
        Ok(())
    }

    /// Adds a peer address with a starting score.
    pub async fn add_peer(&self, address: &str, score: i32) -> Result<()> {
        if !self.is_running() {
            self.peers.load().await?;
        }
        self.peers.add(address).await;
        if !self.peers.update_score(address, score).await {
            return Err(SpyNodeError::General(format!("Failed to update score for {}", address)));
        }
        self.peers.save().await?;
        Ok(())
    }
}

fn random_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

async fn sleep_until_stop(token: &CancellationToken, duration: std::time::Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
