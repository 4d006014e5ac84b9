//! Handler notification dispatch.
//!
//! This module contains:
//! - Registration of handlers and fan out in registration order
//! - Deferral of tx notifications until the node is first ready, with replay in first seen
//!   order at that point
//! - The txids of reverted blocks waiting for the next in-sync point
//! - Locally injected txs whose broadcast is not complete yet
//! - Persistence of all of the above as one blob

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::{StorageError, StorageResult, WireResult};
use crate::handler::{Handler, Headers, MessagePayload, Tx, TxUpdate};
use crate::storage::{Storage, TxStateRepository};
use crate::wire::{Decodable, Encodable, Hash32, Transaction};

const NODE_STATE_KEY: &str = "spynode/node_state";
const NODE_STATE_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventKind {
    Tx = 0,
    Update = 1,
}

/// A notification held back until the node is ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingEvent {
    /// First seen, in milliseconds.
    time: i64,
    kind: EventKind,
    txid: Hash32,
}

impl PendingEvent {
    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.time.consensus_encode(w)?;
        (self.kind as u8).consensus_encode(w)?;
        self.txid.consensus_encode(w)?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> StorageResult<Self> {
        let time = i64::consensus_decode(r)?;
        let kind = match u8::consensus_decode(r)? {
            0 => EventKind::Tx,
            1 => EventKind::Update,
            other => {
                return Err(StorageError::Corruption(format!("Unknown event kind {}", other)));
            }
        };
        let txid = Hash32::consensus_decode(r)?;
        Ok(Self {
            time,
            kind,
            txid,
        })
    }
}

#[derive(Debug, Default)]
struct Deferred {
    synced: bool,
    /// Notifications for txs from the network.
    requests: Vec<PendingEvent>,
    /// Notifications for locally injected txs.
    responses: Vec<PendingEvent>,
    reverted: Vec<Hash32>,
    pending_txs: HashMap<Hash32, Transaction>,
    /// Queue order of `pending_txs`.
    ready_txs: Vec<Hash32>,
}

impl Deferred {
    fn encode(&self) -> std::io::Result<Vec<u8>> {
        let mut data = Vec::new();
        NODE_STATE_VERSION.consensus_encode(&mut data)?;
        for events in [&self.requests, &self.responses] {
            (events.len() as u32).consensus_encode(&mut data)?;
            for event in events {
                event.write(&mut data)?;
            }
        }
        (self.reverted.len() as u32).consensus_encode(&mut data)?;
        for txid in &self.reverted {
            txid.consensus_encode(&mut data)?;
        }

        let pending: Vec<&Hash32> =
            self.ready_txs.iter().filter(|txid| self.pending_txs.contains_key(txid)).collect();
        (pending.len() as u32).consensus_encode(&mut data)?;
        for txid in &pending {
            if let Some(tx) = self.pending_txs.get(txid) {
                txid.consensus_encode(&mut data)?;
                tx.consensus_encode(&mut data)?;
            }
        }
        (pending.len() as u32).consensus_encode(&mut data)?;
        for txid in pending {
            txid.consensus_encode(&mut data)?;
        }
        Ok(data)
    }

    fn decode(data: &[u8]) -> StorageResult<Self> {
        let mut r = Cursor::new(data);
        let version = u8::consensus_decode(&mut r)?;
        if version > NODE_STATE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                key: NODE_STATE_KEY.to_string(),
                version: version as u32,
            });
        }

        let mut deferred = Deferred::default();
        for events in [&mut deferred.requests, &mut deferred.responses] {
            let count = u32::consensus_decode(&mut r)?;
            for _ in 0..count {
                events.push(PendingEvent::read(&mut r)?);
            }
        }
        deferred.reverted = read_hashes(&mut r)?;

        if version >= 1 {
            let count = u32::consensus_decode(&mut r)?;
            for _ in 0..count {
                let txid = Hash32::consensus_decode(&mut r)?;
                let tx = Transaction::consensus_decode(&mut r)?;
                deferred.pending_txs.insert(txid, tx);
            }
            deferred.ready_txs = read_hashes(&mut r)?;
            deferred.ready_txs.retain(|txid| deferred.pending_txs.contains_key(txid));
        }
        Ok(deferred)
    }
}

fn read_hashes<R: Read>(r: &mut R) -> WireResult<Vec<Hash32>> {
    let count = u32::consensus_decode(r)?;
    (0..count).map(|_| Hash32::consensus_decode(&mut *r)).collect()
}

/// Fans notifications out to the registered handlers.
pub(crate) struct EventDispatcher {
    store: Arc<dyn Storage>,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    deferred: Mutex<Deferred>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            handlers: RwLock::new(Vec::new()),
            deferred: Mutex::new(Deferred::default()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn Handler>) {
        self.handlers.write().await.push(handler);
    }

    async fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers.read().await.clone()
    }

    /// Restores the deferred state. Whether the node was ready is not restored.
    pub async fn load(&self) -> StorageResult<()> {
        let loaded = match self.store.read(NODE_STATE_KEY).await {
            Ok(data) => Deferred::decode(&data)?,
            Err(e) if e.is_not_found() => Deferred::default(),
            Err(e) => return Err(e),
        };
        tracing::debug!(
            "Loaded node state: {} pending requests, {} pending responses, {} reverted txs, {} pending txs",
            loaded.requests.len(),
            loaded.responses.len(),
            loaded.reverted.len(),
            loaded.pending_txs.len()
        );

        let mut deferred = self.deferred.lock().await;
        let synced = deferred.synced;
        *deferred = loaded;
        deferred.synced = synced;
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let deferred = self.deferred.lock().await;
        self.store.write(NODE_STATE_KEY, &deferred.encode()?).await
    }

    pub async fn is_synced(&self) -> bool {
        self.deferred.lock().await.synced
    }

    /// Notifies a relevant tx, or defers it until the node is ready.
    ///
    /// `local` marks txs injected by the application. `time` is when the tx was first seen.
    pub async fn handle_tx(&self, tx: &Tx, local: bool, time: i64) {
        {
            let mut deferred = self.deferred.lock().await;
            if !deferred.synced {
                defer(&mut deferred, tx.tx.txid(), EventKind::Tx, local, time);
                return;
            }
        }
        for handler in self.handlers().await {
            handler.handle_tx(tx).await;
        }
    }

    pub async fn handle_tx_update(&self, update: &TxUpdate, local: bool, time: i64) {
        {
            let mut deferred = self.deferred.lock().await;
            if !deferred.synced {
                defer(&mut deferred, update.txid, EventKind::Update, local, time);
                return;
            }
        }
        for handler in self.handlers().await {
            handler.handle_tx_update(update).await;
        }
    }

    pub async fn handle_headers(&self, headers: &Headers) {
        for handler in self.handlers().await {
            handler.handle_headers(headers).await;
        }
    }

    pub async fn handle_message(&self, payload: &MessagePayload) {
        for handler in self.handlers().await {
            handler.handle_message(payload).await;
        }
    }

    /// Sends the in-sync notification and replays every deferred notification in first
    /// seen order, with the state each tx has now. Runs once.
    ///
    /// Handlers are called without holding the dispatcher lock so they may call back into
    /// the node.
    pub async fn in_sync(&self, tx_states: &TxStateRepository) -> StorageResult<()> {
        let mut events: Vec<PendingEvent> = {
            let mut guard = self.deferred.lock().await;
            let deferred = &mut *guard;
            if deferred.synced {
                return Ok(());
            }
            deferred.synced = true;
            deferred.requests.drain(..).chain(deferred.responses.drain(..)).collect()
        };

        let handlers = self.handlers().await;
        for handler in &handlers {
            handler.handle_in_sync().await;
        }

        events.sort_by_key(|event| event.time);
        tracing::info!("Replaying {} deferred tx notifications", events.len());

        for event in events {
            let Some(tx) = tx_states.fetch(&event.txid).await? else {
                tracing::warn!(txid = %event.txid, "Deferred tx state missing");
                continue;
            };
            match event.kind {
                EventKind::Tx => {
                    for handler in &handlers {
                        handler.handle_tx(&tx).await;
                    }
                }
                EventKind::Update => {
                    let update = TxUpdate {
                        txid: event.txid,
                        state: tx.state.clone(),
                    };
                    for handler in &handlers {
                        handler.handle_tx_update(&update).await;
                    }
                }
            }
        }

        self.save().await
    }

    /// Holds txids of reverted blocks until the next in-sync point.
    pub async fn add_reverted(&self, txids: impl IntoIterator<Item = Hash32>) {
        let mut deferred = self.deferred.lock().await;
        for txid in txids {
            if !deferred.reverted.contains(&txid) {
                deferred.reverted.push(txid);
            }
        }
    }

    /// A reverted tx was included in a block again.
    pub async fn confirm(&self, txid: &Hash32) {
        self.deferred.lock().await.reverted.retain(|reverted| reverted != txid);
    }

    pub async fn reverted_count(&self) -> usize {
        self.deferred.lock().await.reverted.len()
    }

    /// Reports every reverted tx that was not included again as cancelled without a
    /// proof, then clears the list.
    pub async fn flush_reverted(&self, tx_states: &TxStateRepository) -> StorageResult<()> {
        let reverted = std::mem::take(&mut self.deferred.lock().await.reverted);
        if reverted.is_empty() {
            return Ok(());
        }

        tracing::info!("Reverting {} txs", reverted.len());
        let handlers = self.handlers().await;
        for txid in reverted {
            let Some(mut tx) = tx_states.fetch(&txid).await? else {
                continue;
            };
            tx.state.merkle_proof = None;
            tx.state.cancelled = true;
            tx.state.safe = false;
            tx_states.save(&tx).await?;

            let update = TxUpdate {
                txid,
                state: tx.state,
            };
            for handler in &handlers {
                handler.handle_tx_update(&update).await;
            }
        }

        self.save().await
    }

    /// Remembers an injected tx until its broadcast is complete.
    pub async fn add_pending_tx(&self, tx: &Transaction) {
        let mut deferred = self.deferred.lock().await;
        let txid = tx.txid();
        if deferred.pending_txs.insert(txid, tx.clone()).is_none() {
            deferred.ready_txs.push(txid);
        }
    }

    pub async fn complete_pending_tx(&self, txid: &Hash32) {
        let mut deferred = self.deferred.lock().await;
        if deferred.pending_txs.remove(txid).is_some() {
            deferred.ready_txs.retain(|ready| ready != txid);
        }
    }

    /// Injected txs whose broadcast is not complete, in the order they were queued.
    pub async fn pending_txs(&self) -> Vec<Transaction> {
        let deferred = self.deferred.lock().await;
        deferred.ready_txs.iter().filter_map(|txid| deferred.pending_txs.get(txid).cloned()).collect()
    }
}

fn defer(deferred: &mut Deferred, txid: Hash32, kind: EventKind, local: bool, time: i64) {
    let event = PendingEvent {
        time,
        kind,
        txid,
    };
    if local {
        deferred.responses.push(event);
    } else {
        deferred.requests.push(event);
    }
}
