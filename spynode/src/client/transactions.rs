//! Unconfirmed transaction processing.
//!
//! This module contains:
//! - The unconfirmed tx loop fed by the trusted node, the untrusted pool and local injection
//! - Double spend detection through the mempool
//! - Relevance checks against the subscribed filter
//! - Resolution of the outputs spent by a relevant tx
//! - The safe delay monitor that promotes unconfirmed txs to safe

use tokio::sync::mpsc;

use crate::error::{Result, SpyNodeError};
use crate::handler::{HandlerError, Tx, TxState, TxUpdate};
use crate::network::TxMessage;
use crate::network::constants::SAFE_DELAY_INTERVAL;
use crate::storage::transactions::now_millis;
use crate::wire::transaction::COINBASE_INDEX;
use crate::wire::{Hash32, OutPoint, Transaction, TxOut};

use super::Node;

impl Node {
    /// Processes unconfirmed txs until the channel is closed.
    ///
    /// A tx whose spent outputs can not be fetched is skipped. Storage failures stop the node.
    pub(super) async fn process_unconfirmed_txs(&self, mut receiver: mpsc::Receiver<TxMessage>) {
        while let Some(message) = receiver.recv().await {
            let txid = message.tx.txid();
            match self.process_unconfirmed_tx(message).await {
                Ok(()) => {}
                Err(SpyNodeError::Handler(e)) => {
                    tracing::warn!(txid = %txid, "Skipping unconfirmed tx: {}", e);
                }
                Err(e) => {
                    tracing::error!(txid = %txid, "Failed to process unconfirmed tx: {}", e);
                    self.fail(e).await;
                    break;
                }
            }
        }
    }

    pub(super) async fn process_unconfirmed_tx(&self, message: TxMessage) -> Result<()> {
        let TxMessage { tx, trusted, safe } = message;
        let txid = tx.txid();

        self.tracker.remove(&txid).await;

        let added = self.mempool.add_transaction(&tx, trusted).await;
        if !added.added {
            if trusted {
                self.txs.mark_trusted(&txid).await;
            }
            return Ok(());
        }
        // Trust can come from an earlier announcement by the trusted node.
        let trusted = trusted || added.trusted;

        if !added.conflicts.is_empty() {
            tracing::warn!(txid = %txid, "Found {} conflicting txs", added.conflicts.len());
            for conflict in &added.conflicts {
                self.mark_double_spent(conflict).await?;
            }
        }

        if !self.is_relevant(&tx).await {
            self.txs.remove(&txid, None).await?;
            return Ok(());
        }
        tracing::info!(txid = %txid, "Tx is relevant");

        if self.txs.contains(&txid, None).await? {
            tracing::info!(txid = %txid, "Tx already added");
            return Ok(());
        }

        // A failed output fetch must leave the repository unchanged.
        let mut state = match self.tx_states.fetch(&txid).await? {
            Some(state) => {
                tracing::info!(txid = %txid, "Updating tx state");
                state
            }
            None => {
                tracing::info!(txid = %txid, "Creating new tx state");
                Tx {
                    outputs: self.fetch_spent_outputs(&tx).await?,
                    tx,
                    state: TxState::default(),
                }
            }
        };

        let (added_to_repo, newly_safe) = self.txs.add(txid, trusted, safe, None).await?;
        if !added_to_repo {
            return Ok(());
        }

        state.state.safe = safe || newly_safe;
        if state.state.merkle_proof.is_none() {
            state.state.unconfirmed_depth = 1;
        }
        if !added.conflicts.is_empty() {
            state.state.unsafe_ = true;
            state.state.safe = false;
            self.txs.mark_unsafe(txid).await;
        }
        self.tx_states.save(&state).await?;

        let first_seen = self.txs.first_seen(&txid).await.unwrap_or_else(now_millis);
        self.events.handle_tx(&state, safe, first_seen).await;
        Ok(())
    }

    /// Reports a relevant unconfirmed tx as unsafe after a conflicting tx was seen.
    async fn mark_double_spent(&self, txid: &Hash32) -> Result<()> {
        if !self.txs.contains(txid, None).await? {
            return Ok(());
        }
        self.txs.mark_unsafe(*txid).await;

        let Some(mut tx) = self.tx_states.fetch(txid).await? else {
            return Ok(());
        };
        tracing::warn!(txid = %txid, "Relevant tx double spent");
        tx.state.unsafe_ = true;
        tx.state.safe = false;
        self.tx_states.save(&tx).await?;

        let update = TxUpdate {
            txid: *txid,
            state: tx.state,
        };
        self.events.handle_tx_update(&update, false, now_millis()).await;
        Ok(())
    }

    pub(super) async fn is_relevant(&self, tx: &Transaction) -> bool {
        self.filter.read().await.is_relevant(tx, self.config.is_test)
    }

    /// Returns the output spent by each input, in input order.
    ///
    /// Coinbase inputs spend nothing. Outputs of stored txs are resolved locally, the rest
    /// through the output fetcher.
    pub(super) async fn fetch_spent_outputs(&self, tx: &Transaction) -> Result<Vec<TxOut>> {
        let mut outputs: Vec<Option<TxOut>> = Vec::with_capacity(tx.input.len());
        let mut to_fetch: Vec<OutPoint> = Vec::new();

        for input in &tx.input {
            let outpoint = input.previous_output;
            if outpoint.vout == COINBASE_INDEX {
                outputs.push(Some(TxOut::default()));
                continue;
            }

            match self.tx_states.fetch(&outpoint.txid).await? {
                Some(spent) => {
                    let output = spent.tx.output.get(outpoint.vout as usize).cloned();
                    outputs.push(Some(output.unwrap_or_default()));
                }
                None => {
                    outputs.push(None);
                    to_fetch.push(outpoint);
                }
            }
        }

        if to_fetch.is_empty() {
            return Ok(outputs.into_iter().flatten().collect());
        }

        let fetcher = self
            .output_fetcher
            .as_ref()
            .ok_or_else(|| HandlerError::Fetch("No output fetcher".to_string()))?;
        let utxos = fetcher.get_outputs(&to_fetch).await?;
        if utxos.len() < to_fetch.len() {
            return Err(HandlerError::Fetch(format!(
                "Not enough outputs returned: {}/{}",
                utxos.len(),
                to_fetch.len()
            ))
            .into());
        }

        let mut fetched = utxos.iter();
        Ok(outputs
            .into_iter()
            .map(|output| match output {
                Some(output) => output,
                None => fetched.next().map(|utxo| utxo.to_tx_out()).unwrap_or_default(),
            })
            .collect())
    }

    /// Promotes unconfirmed txs that outlived the safe delay while the node is ready.
    pub(super) async fn check_tx_delays(&self) {
        tracing::info!("Safe tx delay: {} ms", self.config.safe_tx_delay.as_millis());
        let token = self.stop_token().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(SAFE_DELAY_INTERVAL) => {}
            }
            if !self.is_ready().await {
                continue;
            }

            let cutoff = now_millis() - self.config.safe_tx_delay.as_millis() as i64;
            for txid in self.txs.get_new_safe(&self.mempool, cutoff).await {
                if let Err(e) = self.mark_safe(&txid).await {
                    tracing::error!(txid = %txid, "Failed to mark tx safe: {}", e);
                }
            }
        }
    }

    async fn mark_safe(&self, txid: &Hash32) -> Result<()> {
        let Some(mut tx) = self.tx_states.fetch(txid).await? else {
            tracing::warn!(txid = %txid, "Safe tx has no state");
            return Ok(());
        };
        if tx.state.unsafe_ || tx.state.cancelled || tx.state.safe {
            return Ok(());
        }

        tracing::info!(txid = %txid, "Tx is safe");
        tx.state.safe = true;
        self.tx_states.save(&tx).await?;

        let update = TxUpdate {
            txid: *txid,
            state: tx.state,
        };
        self.events.handle_tx_update(&update, false, now_millis()).await;
        Ok(())
    }

    /// Broadcasts `tx` and feeds it back through the node as a trusted, safe tx.
    pub async fn send_tx(&self, tx: Transaction) -> Result<()> {
        self.broadcast_tx(tx.clone()).await?;
        self.handle_tx(tx).await
    }

    /// Processes `tx` as if the trusted node sent it. Used to feed locally created txs back
    /// to the handlers.
    pub async fn handle_tx(&self, tx: Transaction) -> Result<()> {
        self.unconfirmed
            .add(TxMessage {
                tx,
                trusted: true,
                safe: true,
            })
            .await
    }
}
