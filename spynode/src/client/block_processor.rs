//! Block processing.
//!
//! This module contains:
//! - The block loop, which processes downloaded blocks in chain order and requests more
//! - `process_block`, which confirms relevant txs with merkle proofs and detects double
//!   spends of unconfirmed txs
//! - `provide_block`, which replays a stored block to the handlers during a refeed

use std::time::Instant;

use crate::error::{BlockError, Result, SpyNodeError};
use crate::handler::{Headers, Tx, TxState, TxUpdate};
use crate::merkle::{MerkleProof, MerkleTree};
use crate::network::constants::BLOCK_POLL_INTERVAL;
use crate::network::inventory_requests;
use crate::storage::transactions::now_millis;
use crate::wire::{Block, BlockHeader, Hash32, Inventory, NetworkMessage, Transaction};

use super::Node;

/// How a block tx relates to what the node already reported.
struct Confirmed<'a> {
    tx: &'a Transaction,
    /// Not reported before.
    is_new: bool,
    /// No conflicting tx was seen.
    safe: bool,
}

impl Node {
    /// Processes received blocks until the connection ends. Fatal block errors stop the node.
    pub(super) async fn process_blocks(&self) {
        let token = self.stop_token().await;
        while !token.is_cancelled() {
            match self.process_next_block().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Block processing failed: {}", e);
                    self.fail(e).await;
                    return;
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(BLOCK_POLL_INTERVAL) => {}
            }
        }
    }

    /// Returns true when a block was processed.
    pub(super) async fn process_next_block(&self) -> Result<bool> {
        if self.refeeder.lock().await.is_active() {
            self.refeed_next_block().await?;
            return Ok(false);
        }

        let next = self.state.lock().await.next_block();
        let Some(block) = next else {
            return Ok(false);
        };

        let hash = block.block_hash();
        match self.process_block(block).await {
            Ok(()) => {}
            Err(SpyNodeError::Block(e)) if e.is_benign() => {
                tracing::debug!(hash = %hash, "Block skipped: {}", e);
            }
            Err(SpyNodeError::Block(BlockError::InvalidMerkleRoot(hash))) => {
                tracing::warn!(hash = %hash, "Invalid merkle root, requesting blocks again");
                let last_hash = self.blocks.last_hash().await;
                let mut state = self.state.lock().await;
                state.clear_block_requests();
                state.set_last_hash(last_hash);
                state.clear_headers_requested();
                return Ok(true);
            }
            Err(e) => return Err(e),
        }

        let mut requests = Vec::new();
        {
            let mut state = self.state.lock().await;
            while let Some((hash, _)) = state.get_next_block_to_request() {
                requests.push(Inventory::Block(hash));
            }
        }
        self.send_messages(inventory_requests(requests)).await;
        Ok(true)
    }

    async fn send_messages(&self, messages: Vec<NetworkMessage>) {
        for message in messages {
            if let Err(e) = self.outgoing.add(message).await {
                tracing::debug!("Message not sent: {}", e);
                return;
            }
        }
    }

    async fn refeed_next_block(&self) -> Result<()> {
        let taken = self.refeeder.lock().await.take_block();
        if let Some((block, height)) = taken {
            if let Err(e) = self.provide_block(&block, height).await {
                tracing::warn!(height, "Failed to refeed block: {}", e);
            }

            if self.blocks.last_height().await <= height {
                tracing::info!(height, "Refeed complete");
                self.refeeder.lock().await.clear(height);
            } else {
                let hash = self.blocks.hash(height + 1).await?;
                self.refeeder.lock().await.increment(height + 1, hash);
            }
        }

        let request = self.refeeder.lock().await.block_to_request();
        if let Some(hash) = request {
            tracing::debug!(hash = %hash, "Requesting refeed block");
            self.send_messages(vec![NetworkMessage::GetData(vec![Inventory::Block(hash)])]).await;
        }
        Ok(())
    }

    /// Adds the next block of the chain, confirming relevant txs and cancelling unconfirmed
    /// txs it double spends.
    pub(super) async fn process_block(&self, block: Block) -> Result<()> {
        let started = Instant::now();
        let _block_lock = self.block_lock.lock().await;

        let header = block.header;
        let hash = block.block_hash();
        if self.blocks.contains(&hash).await {
            tracing::warn!(hash = %hash, "Block already added");
            return Err(BlockError::NotAdded(hash).into());
        }
        if header.prev_blockhash != self.blocks.last_hash().await {
            tracing::warn!(hash = %hash, previous_hash = %header.prev_blockhash, "Block not next");
            return Err(BlockError::NotNextBlock(hash).into());
        }
        if !block.check_merkle_root() {
            tracing::warn!(hash = %hash, "Block merkle root does not match its txs");
            return Err(BlockError::InvalidMerkleRoot(hash).into());
        }

        self.blocks.add(&header).await?;
        let ready = self.is_ready().await;
        if ready {
            self.blocks.save().await?;
        }
        let height = self.blocks.last_height().await;

        let mut unconfirmed = self.txs.lock_unconfirmed().await;

        if self.filter.read().await.headers() {
            let headers = Headers {
                request_height: 0,
                start_height: height,
                headers: vec![header],
            };
            self.events.handle_headers(&headers).await;
        }

        let mut tree = MerkleTree::new();
        let mut confirmed = Vec::new();
        let mut txids = Vec::with_capacity(block.txdata.len());
        for tx in &block.txdata {
            let txid = tx.txid();
            txids.push(txid);

            let in_unconfirmed = unconfirmed.remove(&txid);
            let in_mempool = ready && self.mempool.remove_transaction(&txid).await;

            if in_unconfirmed {
                self.txs.add(txid, true, true, Some(height)).await?;
                tree.add_merkle_proof(txid);
                confirmed.push(Confirmed {
                    tx,
                    is_new: false,
                    safe: true,
                });
            } else if !in_mempool {
                let conflicts = self.mempool.conflicting(tx).await;
                let safe = conflicts.is_empty();
                for conflict in conflicts {
                    if unconfirmed.was_unconfirmed(&conflict) {
                        tracing::warn!(txid = %conflict, spender = %txid, "Unconfirmed tx double spent in block");
                        unconfirmed.mark_unsafe(conflict);
                        self.cancel_tx(&conflict).await?;
                    }
                }

                if self.is_relevant(tx).await {
                    self.txs.add(txid, true, true, Some(height)).await?;
                    tree.add_merkle_proof(txid);
                    confirmed.push(Confirmed {
                        tx,
                        is_new: true,
                        safe,
                    });
                } else {
                    self.txs.remove(&txid, Some(height)).await?;
                }
            }

            tree.add_hash(txid);
        }

        let (root, proofs) = tree.finalize_merkle_proofs();
        if root != Some(header.merkle_root) {
            return Err(BlockError::MerkleProofMismatch(hash).into());
        }

        let now = now_millis();
        for (entry, proof) in confirmed.into_iter().zip(proofs) {
            self.confirm_tx(entry, proof, &header, now).await?;
        }

        self.cleanup_block(&txids).await;

        if !ready {
            let mut state = self.state.lock().await;
            if !state.is_ready() && state.pending_sync && state.block_requests_empty() {
                tracing::info!(height, "Blocks in sync");
                state.set_in_sync();
            }
        }

        unconfirmed.finalize().await?;

        tracing::debug!(
            height,
            hash = %hash,
            "Processed block with {} txs in {:?}",
            block.txdata.len(),
            started.elapsed()
        );
        Ok(())
    }

    async fn confirm_tx(
        &self,
        entry: Confirmed<'_>,
        mut proof: MerkleProof,
        header: &BlockHeader,
        now: i64,
    ) -> Result<()> {
        let txid = entry.tx.txid();
        proof.block_header = Some(*header);

        let existing = if entry.is_new {
            None
        } else {
            self.tx_states.fetch(&txid).await?
        };

        match existing {
            Some(mut tx) => {
                tracing::info!(txid = %txid, "Tx confirmed");
                tx.state.merkle_proof = Some(proof);
                tx.state.unconfirmed_depth = 0;
                tx.state.cancelled = false;
                let safe = entry.safe && !tx.state.unsafe_;
                tx.state.safe = safe;
                tx.state.unsafe_ = !safe;
                self.tx_states.save(&tx).await?;

                let update = TxUpdate {
                    txid,
                    state: tx.state,
                };
                self.events.handle_tx_update(&update, false, now).await;
            }
            None => {
                tracing::info!(txid = %txid, "New tx confirmed");
                let tx = Tx {
                    outputs: self.fetch_spent_outputs(entry.tx).await?,
                    tx: entry.tx.clone(),
                    state: TxState {
                        safe: entry.safe,
                        unsafe_: !entry.safe,
                        cancelled: false,
                        unconfirmed_depth: 0,
                        merkle_proof: Some(proof),
                    },
                };
                self.tx_states.save(&tx).await?;
                self.events.handle_tx(&tx, false, now).await;
            }
        }

        self.events.confirm(&txid).await;
        Ok(())
    }

    /// A conflicting tx was confirmed.
    async fn cancel_tx(&self, txid: &Hash32) -> Result<()> {
        let Some(mut tx) = self.tx_states.fetch(txid).await? else {
            tracing::warn!(txid = %txid, "Cancelled tx has no state");
            return Ok(());
        };
        tx.state.safe = false;
        tx.state.unsafe_ = true;
        tx.state.cancelled = true;
        self.tx_states.save(&tx).await?;

        let update = TxUpdate {
            txid: *txid,
            state: tx.state,
        };
        self.events.handle_tx_update(&update, false, now_millis()).await;
        Ok(())
    }

    /// Drops requests for txs that are now in a block.
    pub(super) async fn cleanup_block(&self, txids: &[Hash32]) {
        self.tracker.remove_list(txids).await;
        let untrusted = self.untrusted.lock().await.clone();
        for node in untrusted {
            node.cleanup_block(txids).await;
        }
    }

    /// Reports the relevant txs of a stored block again, with proofs.
    pub(super) async fn provide_block(&self, block: &Block, height: u32) -> Result<()> {
        let header = block.header;
        tracing::info!(height, "Refeeding block");

        if self.filter.read().await.headers() {
            let headers = Headers {
                request_height: height as i32,
                start_height: height,
                headers: vec![header],
            };
            self.events.handle_headers(&headers).await;
        }

        let mut tree = MerkleTree::new();
        let mut relevant = Vec::new();
        for tx in &block.txdata {
            let txid = tx.txid();
            if self.is_relevant(tx).await {
                self.txs.add(txid, true, true, Some(height)).await?;
                tree.add_merkle_proof(txid);
                relevant.push(tx);
            }
            tree.add_hash(txid);
        }

        let (root, proofs) = tree.finalize_merkle_proofs();
        if root != Some(header.merkle_root) {
            return Err(BlockError::InvalidMerkleRoot(block.block_hash()).into());
        }

        let now = now_millis();
        for (tx, mut proof) in relevant.into_iter().zip(proofs) {
            let txid = tx.txid();
            proof.block_header = Some(header);
            let state = match self.tx_states.fetch(&txid).await? {
                Some(state) => state,
                None => {
                    let state = Tx {
                        outputs: self.fetch_spent_outputs(tx).await?,
                        tx: tx.clone(),
                        state: TxState {
                            safe: true,
                            merkle_proof: Some(proof),
                            ..TxState::default()
                        },
                    };
                    self.tx_states.save(&state).await?;
                    state
                }
            };
            self.events.handle_tx(&state, false, now).await;
        }
        Ok(())
    }
}
