//! Transactions announced by one peer while another peer's request for them is still open.
//!
//! If the other peer never delivers, the transaction is requested again from the peer that
//! announced it. Confirmed transactions are dropped through [`TxTracker::remove_list`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::MemPool;
use crate::wire::{Hash32, Inventory, NetworkMessage};

/// Inventory entries per re-request message.
const MAX_REQUEST_BATCH: usize = 100;

#[derive(Debug, Default)]
pub struct TxTracker {
    txids: Mutex<HashMap<Hash32, Instant>>,
    stopped: AtomicBool,
}

impl TxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Re-enables checks after [`stop`](Self::stop), for a new connection.
    pub fn resume(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn add(&self, txid: Hash32) {
        self.txids.lock().await.entry(txid).or_insert_with(Instant::now);
    }

    pub async fn remove(&self, txid: &Hash32) {
        self.txids.lock().await.remove(txid);
    }

    pub async fn remove_list(&self, txids: &[Hash32]) {
        let mut tracked = self.txids.lock().await;
        for txid in txids {
            tracked.remove(txid);
        }
    }

    pub async fn len(&self) -> usize {
        self.txids.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.txids.lock().await.is_empty()
    }

    /// Builds `getdata` messages for tracked transactions that can be requested again.
    ///
    /// Transactions that arrived in the meantime are dropped. Requested ones stop being
    /// tracked.
    pub async fn check(&self, mempool: &MemPool) -> Vec<NetworkMessage> {
        if self.is_stopped() {
            return Vec::new();
        }

        let mut tracked = self.txids.lock().await;
        let mut messages = Vec::new();
        let mut batch = Vec::new();
        let candidates: Vec<Hash32> = tracked.keys().copied().collect();
        for txid in candidates {
            if self.is_stopped() {
                break;
            }

            let (already_have, should_request) = mempool.add_request(txid, false).await;
            if already_have {
                tracked.remove(&txid);
            } else if should_request {
                tracked.remove(&txid);
                batch.push(Inventory::Transaction(txid));
                if batch.len() == MAX_REQUEST_BATCH {
                    messages.push(NetworkMessage::GetData(std::mem::take(&mut batch)));
                }
            }
        }

        if !batch.is_empty() {
            messages.push(NetworkMessage::GetData(batch));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{OutPoint, Transaction, TxIn};

    fn tx(marker: u8) -> Transaction {
        Transaction {
            version: 1,
            input: vec![TxIn {
                previous_output: OutPoint::new(Hash32::hash(&[marker]), 0),
                script_sig: vec![],
                sequence: 0,
            }],
            output: vec![],
            lock_time: 0,
        }
    }

    #[tokio::test]
    async fn test_check_requests_untaken_announcements() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();

        let received = tx(1);
        mempool.add_transaction(&received, false).await;
        tracker.add(received.txid()).await;

        let missing = Hash32::hash(b"missing");
        tracker.add(missing).await;

        let messages = tracker.check(&mempool).await;
        assert_eq!(messages, vec![NetworkMessage::GetData(vec![Inventory::Transaction(missing)])]);
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_check_waits_for_open_request() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        let txid = Hash32::hash(b"requested elsewhere");

        assert_eq!(mempool.add_request(txid, true).await, (false, true));
        tracker.add(txid).await;
        assert!(tracker.check(&mempool).await.is_empty());
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_check_batches() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        for i in 0..250u32 {
            tracker.add(Hash32::hash(&i.to_le_bytes())).await;
        }
        let messages = tracker.check(&mempool).await;
        let sizes: Vec<usize> = messages
            .iter()
            .map(|m| match m {
                NetworkMessage::GetData(items) => items.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn test_remove_list_stop_and_resume() {
        let mempool = MemPool::new();
        let tracker = TxTracker::new();
        let a = Hash32::hash(b"a");
        let b = Hash32::hash(b"b");
        tracker.add(a).await;
        tracker.add(b).await;
        tracker.remove_list(&[a]).await;
        assert_eq!(tracker.len().await, 1);

        tracker.stop();
        assert!(tracker.check(&mempool).await.is_empty());
        assert_eq!(tracker.len().await, 1);

        tracker.resume();
        assert_eq!(tracker.check(&mempool).await.len(), 1);
        assert!(tracker.is_empty().await);
    }
}
