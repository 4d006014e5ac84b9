//! Chain and transaction lookups, and filter subscriptions.

use crate::error::{Result, StorageError};
use crate::handler::{HandlerError, Headers, Utxo};
use crate::wire::{Hash32, OutPoint, Transaction};

use super::Node;

impl Node {
    pub async fn last_height(&self) -> u32 {
        self.blocks.last_height().await
    }

    pub async fn hash(&self, height: u32) -> Result<Hash32> {
        Ok(self.blocks.hash(height).await?)
    }

    /// Hash at `height`, or of the tip when `height` is -1.
    pub async fn block_hash(&self, height: i32) -> Result<Hash32> {
        let height = match height {
            -1 => self.blocks.last_height().await,
            h if h < 0 => return Err(StorageError::InvalidHeight(h as i64).into()),
            h => h as u32,
        };
        self.hash(height).await
    }

    /// Header timestamp at `height`, zero beyond the tip.
    pub async fn time(&self, height: u32) -> Result<u32> {
        Ok(self.blocks.time(height).await?)
    }

    /// Up to `max_count` consecutive headers from `height`, or the last `max_count` headers
    /// when `height` is -1. Headers beyond the tip are not returned.
    pub async fn get_headers(&self, height: i32, max_count: usize) -> Result<Headers> {
        let last_height = self.blocks.last_height().await;
        let start_height = match height {
            -1 => (last_height + 1).saturating_sub(max_count as u32),
            h if h < 0 => return Err(StorageError::InvalidHeight(h as i64).into()),
            h => h as u32,
        };

        let mut headers = Vec::new();
        let end = start_height.saturating_add(max_count as u32).min(last_height.saturating_add(1));
        for h in start_height..end {
            headers.push(self.blocks.header(h).await?);
        }

        Ok(Headers {
            request_height: height,
            start_height,
            headers,
        })
    }

    /// Reports the relevant txs of every stored block from `height` to the tip again.
    pub async fn refeed_blocks_from_height(&self, height: u32) -> Result<()> {
        let hash = self.blocks.hash(height).await?;
        tracing::info!(height, hash = %hash, "Refeeding blocks");
        self.refeeder.lock().await.set_height(height, hash);
        Ok(())
    }

    /// Stored txs first, then the tx fetcher.
    pub async fn get_tx(&self, txid: Hash32) -> Result<Transaction> {
        if let Some(tx) = self.tx_states.fetch(&txid).await? {
            return Ok(tx.tx);
        }
        let fetcher = self
            .tx_fetcher
            .as_ref()
            .ok_or_else(|| HandlerError::Fetch("No tx fetcher".to_string()))?;
        Ok(fetcher.get_tx(txid).await?)
    }

    pub async fn get_outputs(&self, outpoints: &[OutPoint]) -> Result<Vec<Utxo>> {
        let fetcher = self
            .output_fetcher
            .as_ref()
            .ok_or_else(|| HandlerError::Fetch("No output fetcher".to_string()))?;
        Ok(fetcher.get_outputs(outpoints).await?)
    }

    /// Txs with one of these push datas in a script become relevant. 20 byte push datas are
    /// taken as hashes.
    pub async fn subscribe_push_datas(&self, push_datas: &[Vec<u8>]) {
        self.filter.write().await.add_push_datas(push_datas);
    }

    pub async fn unsubscribe_push_datas(&self, push_datas: &[Vec<u8>]) {
        self.filter.write().await.remove_push_datas(push_datas);
    }

    /// Contract formations and asset creations become relevant.
    pub async fn subscribe_contracts(&self) {
        tracing::info!("Subscribing to contracts");
        self.filter.write().await.set_contracts(true);
    }

    pub async fn unsubscribe_contracts(&self) {
        tracing::info!("Unsubscribing from contracts");
        self.filter.write().await.set_contracts(false);
    }

    /// New headers are reported through `handle_headers`.
    pub async fn subscribe_headers(&self) {
        tracing::info!("Subscribing to headers");
        self.filter.write().await.set_headers(true);
    }

    pub async fn unsubscribe_headers(&self) {
        tracing::info!("Unsubscribing from headers");
        self.filter.write().await.set_headers(false);
    }
}
