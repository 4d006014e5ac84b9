use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::handler::{
    Handler, HandlerError, Headers, MessagePayload, OutputFetcher, Tx, TxFetcher, TxUpdate, Utxo,
};
use crate::wire::{Hash32, OutPoint, Transaction};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Tx(Tx),
    TxUpdate(TxUpdate),
    Headers(Headers),
    InSync,
    Message(MessagePayload),
}

/// Records every notification in arrival order.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }

    pub async fn txs(&self) -> Vec<Tx> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::Tx(tx) => Some(tx.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn updates(&self) -> Vec<TxUpdate> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::TxUpdate(update) => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn headers(&self) -> Vec<Headers> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::Headers(headers) => Some(headers.clone()),
                _ => None,
            })
            .collect()
    }

    /// Transaction ids of tx and update events in the order received.
    pub async fn txids(&self) -> Vec<Hash32> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::Tx(tx) => Some(tx.tx.txid()),
                Event::TxUpdate(update) => Some(update.txid),
                _ => None,
            })
            .collect()
    }

    pub async fn in_sync_count(&self) -> usize {
        self.events.lock().await.iter().filter(|event| **event == Event::InSync).count()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle_tx(&self, tx: &Tx) {
        self.events.lock().await.push(Event::Tx(tx.clone()));
    }

    async fn handle_tx_update(&self, update: &TxUpdate) {
        self.events.lock().await.push(Event::TxUpdate(update.clone()));
    }

    async fn handle_headers(&self, headers: &Headers) {
        self.events.lock().await.push(Event::Headers(headers.clone()));
    }

    async fn handle_in_sync(&self) {
        self.events.lock().await.push(Event::InSync);
    }

    async fn handle_message(&self, payload: &MessagePayload) {
        self.events.lock().await.push(Event::Message(payload.clone()));
    }
}

#[derive(Default)]
pub struct MockTxFetcher {
    pub txs: Mutex<HashMap<Hash32, Transaction>>,
}

impl MockTxFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, tx: Transaction) {
        self.txs.lock().await.insert(tx.txid(), tx);
    }
}

#[async_trait]
impl TxFetcher for MockTxFetcher {
    async fn get_tx(&self, txid: Hash32) -> Result<Transaction, HandlerError> {
        self.txs
            .lock()
            .await
            .get(&txid)
            .cloned()
            .ok_or_else(|| HandlerError::Fetch(format!("unknown tx {}", txid)))
    }
}

/// Serves outputs from a map. Unknown outpoints are an error.
#[derive(Default)]
pub struct MockOutputFetcher {
    pub utxos: Mutex<HashMap<OutPoint, Utxo>>,
}

impl MockOutputFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, utxo: Utxo) {
        self.utxos.lock().await.insert(utxo.outpoint(), utxo);
    }
}

#[async_trait]
impl OutputFetcher for MockOutputFetcher {
    async fn get_outputs(&self, outpoints: &[OutPoint]) -> Result<Vec<Utxo>, HandlerError> {
        let utxos = self.utxos.lock().await;
        outpoints
            .iter()
            .map(|outpoint| {
                utxos
                    .get(outpoint)
                    .cloned()
                    .ok_or_else(|| HandlerError::Fetch(format!("unknown output {}", outpoint)))
            })
            .collect()
    }
}
