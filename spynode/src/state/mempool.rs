//! Announced transactions that have not confirmed yet.
//!
//! The mempool is not persisted. It prevents duplicate requests for the same transaction
//! and finds transactions spending the same outpoint.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::wire::{Hash32, OutPoint, Transaction};

/// An outstanding request is repeated to another peer after this long.
const REQUEST_RETRY: Duration = Duration::from_secs(3);
/// Requested transactions that never arrived are forgotten after this long.
const REQUEST_EXPIRY: Duration = Duration::from_secs(600);
/// Minimum time between scans for expired requests.
const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct MemPoolTx {
    /// Spent outpoints, empty until the transaction itself arrives.
    outpoints: Vec<OutPoint>,
    trusted: bool,
}

#[derive(Debug, Default)]
struct Pool {
    txs: HashMap<Hash32, MemPoolTx>,
    /// Spending txids by outpoint.
    inputs: HashMap<OutPoint, Vec<Hash32>>,
    requests: HashMap<Hash32, Instant>,
    last_expiry: Option<Instant>,
}

impl Pool {
    /// Drops announced transactions that were requested but never received.
    fn expire_requests(&mut self, now: Instant) -> usize {
        let expired: Vec<Hash32> = self
            .requests
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > REQUEST_EXPIRY)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &expired {
            self.requests.remove(txid);
            if self.txs.get(txid).is_some_and(|tx| tx.outpoints.is_empty()) {
                self.txs.remove(txid);
            }
        }
        self.last_expiry = Some(now);
        expired.len()
    }

    fn remove(&mut self, txid: &Hash32) -> bool {
        self.requests.remove(txid);
        let Some(tx) = self.txs.remove(txid) else {
            return false;
        };
        for outpoint in &tx.outpoints {
            if let Some(spenders) = self.inputs.get_mut(outpoint) {
                spenders.retain(|spender| spender != txid);
                if spenders.is_empty() {
                    self.inputs.remove(outpoint);
                }
            }
        }
        !tx.outpoints.is_empty()
    }
}

/// Result of [`MemPool::add_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddTransaction {
    /// Other transactions spending one of the same outpoints.
    pub conflicts: Vec<Hash32>,
    /// The transaction was marked trusted by this or an earlier call.
    pub trusted: bool,
    /// False when the transaction was already in the mempool.
    pub added: bool,
}

#[derive(Debug, Default)]
pub struct MemPool {
    pool: Mutex<Pool>,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement of `txid`.
    ///
    /// Returns `(already_have, should_request)`. A transaction is requested when it was
    /// never requested or the last request is older than three seconds. Requests that
    /// were not answered within ten minutes are dropped.
    pub async fn add_request(&self, txid: Hash32, trusted: bool) -> (bool, bool) {
        let mut pool = self.pool.lock().await;
        let now = Instant::now();
        if pool.last_expiry.is_none_or(|at| now.duration_since(at) > EXPIRY_INTERVAL) {
            let expired = pool.expire_requests(now);
            if expired > 0 {
                tracing::debug!("Expired {} mempool requests", expired);
            }
        }

        let entry = pool.txs.entry(txid).or_insert_with(|| MemPoolTx {
            outpoints: Vec::new(),
            trusted,
        });
        entry.trusted |= trusted;
        if !entry.outpoints.is_empty() {
            return (true, false);
        }

        let pending =
            pool.requests.get(&txid).is_some_and(|at| now.duration_since(*at) <= REQUEST_RETRY);
        if pending {
            return (false, false);
        }
        pool.requests.insert(txid, now);
        (false, true)
    }

    /// Adds a received transaction and reports transactions spending the same outpoints.
    pub async fn add_transaction(&self, tx: &Transaction, trusted: bool) -> AddTransaction {
        let mut pool = self.pool.lock().await;
        let txid = tx.txid();
        pool.requests.remove(&txid);

        let entry = pool.txs.entry(txid).or_insert_with(|| MemPoolTx {
            outpoints: Vec::new(),
            trusted,
        });
        entry.trusted |= trusted;
        let trusted = entry.trusted;
        if !entry.outpoints.is_empty() {
            return AddTransaction {
                conflicts: Vec::new(),
                trusted,
                added: false,
            };
        }
        entry.outpoints = tx.input.iter().map(|input| input.previous_output).collect();
        let outpoints = entry.outpoints.clone();

        let mut conflicts = Vec::new();
        for outpoint in outpoints {
            let spenders = pool.inputs.entry(outpoint).or_default();
            for spender in spenders.iter() {
                if *spender != txid && !conflicts.contains(spender) {
                    conflicts.push(*spender);
                }
            }
            if !spenders.contains(&txid) {
                spenders.push(txid);
            }
        }

        AddTransaction {
            conflicts,
            trusted,
            added: true,
        }
    }

    /// Returns true when the transaction itself was in the mempool.
    pub async fn remove_transaction(&self, txid: &Hash32) -> bool {
        self.pool.lock().await.remove(txid)
    }

    pub async fn transaction_exists(&self, txid: &Hash32) -> bool {
        self.pool.lock().await.txs.get(txid).is_some_and(|tx| !tx.outpoints.is_empty())
    }

    pub async fn is_trusted(&self, txid: &Hash32) -> bool {
        self.pool.lock().await.txs.get(txid).is_some_and(|tx| tx.trusted)
    }

    /// Removes and returns the mempool transactions spending any input of `tx`.
    pub async fn conflicting(&self, tx: &Transaction) -> Vec<Hash32> {
        let mut pool = self.pool.lock().await;
        let txid = tx.txid();
        let mut result = Vec::new();
        for input in &tx.input {
            let Some(spenders) = pool.inputs.get(&input.previous_output) else {
                continue;
            };
            for spender in spenders.clone() {
                if spender != txid && !result.contains(&spender) {
                    result.push(spender);
                }
            }
        }
        for spender in &result {
            pool.remove(spender);
        }
        result
    }

    pub async fn len(&self) -> usize {
        self.pool.lock().await.txs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pool.lock().await.txs.is_empty()
    }
}
