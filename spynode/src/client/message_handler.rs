//! Handling of messages from the trusted node.
//!
//! Headers drive the chain: each header extending the pipeline queues its block for
//! download, a header branching off queued blocks replaces them, and a header branching off
//! processed blocks reverts them.

use crate::error::{Result, StorageError};
use crate::network::{TxMessage, inventory_requests};
use crate::state::SyncState;
use crate::storage::{Reorg, ReorgBlock};
use crate::wire::message::{PROTOCOL_VERSION, TimedAddress};
use crate::wire::{Block, BlockHeader, Hash32, Inventory, NetworkMessage, Transaction};

use super::Node;

impl Node {
    /// Handles one message and returns the responses to send.
    pub(super) async fn handle_message(&self, message: NetworkMessage) -> Result<Vec<NetworkMessage>> {
        match message {
            NetworkMessage::Ping(nonce) => Ok(vec![NetworkMessage::Pong(nonce)]),
            NetworkMessage::Version(version) => {
                let mut state = self.state.lock().await;
                state.version_received = true;
                state.protocol_version = version.version.min(PROTOCOL_VERSION);
                tracing::info!(
                    "Trusted node version {} {} at height {}",
                    version.version,
                    version.user_agent,
                    version.start_height
                );
                Ok(vec![NetworkMessage::Verack])
            }
            NetworkMessage::Addr(addresses) => {
                self.handle_addresses(addresses).await;
                Ok(Vec::new())
            }
            NetworkMessage::Inv(items) => Ok(self.handle_inventory(items).await),
            NetworkMessage::Tx(tx) => {
                self.handle_trusted_tx(tx).await?;
                Ok(Vec::new())
            }
            NetworkMessage::Block(block) => {
                self.handle_block(block).await;
                Ok(Vec::new())
            }
            NetworkMessage::Headers(headers) => self.handle_headers(headers).await,
            NetworkMessage::NotFound(items) => {
                for item in items {
                    if let Inventory::Transaction(txid) = item {
                        self.tracker.remove(&txid).await;
                    }
                }
                Ok(Vec::new())
            }
            NetworkMessage::Verack | NetworkMessage::Pong(_) | NetworkMessage::Reject(_) => {
                Ok(Vec::new())
            }
            other => {
                tracing::trace!("Skipping {} message from trusted node", other.command());
                Ok(Vec::new())
            }
        }
    }

    async fn handle_addresses(&self, addresses: Vec<TimedAddress>) {
        let mut added = 0;
        for entry in addresses {
            if self.peers.add(&entry.address.socket_addr().to_string()).await {
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!("Added {} peer addresses", added);
        }
    }

    /// Requests announced txs. Blocks are learned from headers instead.
    async fn handle_inventory(&self, items: Vec<Inventory>) -> Vec<NetworkMessage> {
        if !self.is_ready().await {
            return Vec::new();
        }

        let mut requests = Vec::new();
        for item in items {
            let Inventory::Transaction(txid) = item else {
                continue;
            };
            let (already_have, should_request) = self.mempool.add_request(txid, true).await;
            if already_have {
                continue;
            }
            if should_request {
                requests.push(Inventory::Transaction(txid));
            } else {
                self.tracker.add(txid).await;
            }
        }
        inventory_requests(requests)
    }

    /// Txs seen before the node is ready are skipped. Without a mempool they could be
    /// reported twice.
    async fn handle_trusted_tx(&self, tx: Transaction) -> Result<()> {
        if !self.is_ready().await {
            return Ok(());
        }
        self.unconfirmed
            .add(TxMessage {
                tx,
                trusted: true,
                safe: false,
            })
            .await
    }

    async fn handle_block(&self, block: Block) {
        let hash = block.block_hash();
        {
            let mut refeeder = self.refeeder.lock().await;
            if refeeder.is_waiting_for(&hash) {
                refeeder.set_block(&hash, block);
                return;
            }
        }

        if !self.state.lock().await.add_block(block) {
            tracing::debug!(hash = %hash, "Received unrequested block");
        }
    }

    /// Headers arrive lowest first.
    pub(super) async fn handle_headers(&self, headers: Vec<BlockHeader>) -> Result<Vec<NetworkMessage>> {
        let _block_lock = self.block_lock.lock().await;
        let mut state = self.state.lock().await;

        let mut last_hash = state.last_hash();
        if !state.is_ready()
            && (headers.is_empty()
                || (headers.len() == 1 && headers[0].block_hash() == last_hash))
        {
            let height = self.blocks.last_height().await;
            tracing::info!(height, "Headers in sync");
            state.pending_sync = true;
            if state.start_height.is_none() {
                tracing::error!("Headers in sync before start block found");
                state.set_in_sync();
            } else if state.block_requests_empty() {
                tracing::info!(height, "Blocks in sync");
                state.set_in_sync();
            }
            state.clear_headers_requested();
            drop(state);
            self.blocks.save().await?;
            return Ok(Vec::new());
        }

        let mut requests = Vec::new();
        let mut modified = false;
        let mut added = 0usize;
        for header in &headers {
            let hash = header.block_hash();

            if header.prev_blockhash == last_hash {
                if headers.len() < 10 {
                    tracing::info!(hash = %hash, "Adding header");
                }
                if self.check_start_height(&mut state, header).await? {
                    request_block(&mut state, header, hash, &mut requests);
                }
                added += 1;
                last_hash = hash;
                modified = true;
                continue;
            }

            if hash == last_hash {
                continue;
            }

            tracing::info!(
                hash = %hash,
                previous_hash = %header.prev_blockhash,
                last_hash = %last_hash,
                "Header not next"
            );

            if self.blocks.contains(&hash).await
                || state.block_is_requested(&hash)
                || state.block_is_to_be_requested(&hash)
            {
                continue;
            }

            if state.block_is_requested(&header.prev_blockhash)
                || state.block_is_to_be_requested(&header.prev_blockhash)
            {
                tracing::info!("Reorg in pending blocks");
                state.clear_block_requests_after(&header.prev_blockhash);
                request_block(&mut state, header, hash, &mut requests);
                last_hash = hash;
                modified = true;
                added = 1;
                continue;
            }

            if let Some(reorg_height) = self.blocks.height(&header.prev_blockhash).await {
                state.clear_in_sync();
                state.clear_block_requests();
                if reorg_height == self.blocks.last_height().await {
                    tracing::info!("Reorg on latest block");
                    continue;
                }

                self.revert_to(&mut state, reorg_height, &header.prev_blockhash).await?;
                if self.check_start_height(&mut state, header).await? {
                    request_block(&mut state, header, hash, &mut requests);
                }
                last_hash = hash;
                modified = true;
                added = 1;
                continue;
            }

            // Unknown blocks are expected while the peer reorgs.
            tracing::debug!(hash = %hash, previous_hash = %header.prev_blockhash, "Unknown header");
            break;
        }

        if modified {
            state.clear_headers_requested();
        }
        if added > 0 {
            let height = self.blocks.last_height().await as usize + state.total_block_request_count();
            tracing::info!("Added {} headers to height {}", added, height);
        }
        Ok(inventory_requests(requests))
    }

    /// Reverts processed blocks above `reorg_height`, records the reorg and moves their
    /// relevant txids back to unconfirmed.
    async fn revert_to(
        &self,
        state: &mut SyncState,
        reorg_height: u32,
        prev_hash: &Hash32,
    ) -> Result<()> {
        tracing::info!(height = reorg_height, "Reorging");

        let mut reorg = Reorg {
            block_height: reorg_height,
            blocks: Vec::new(),
        };
        let last_height = self.blocks.last_height().await;
        for height in (reorg_height + 1..=last_height).rev() {
            let header = self.blocks.header(height).await?;
            let block_txs = self.txs.get_block(height).await?;
            let txids = block_txs.txids.clone();
            if txids.is_empty() {
                block_txs.release();
            } else {
                block_txs.remove().await?;
            }
            reorg.blocks.insert(
                0,
                ReorgBlock {
                    header,
                    txids,
                },
            );
        }

        if reorg.blocks.is_empty() {
            tracing::info!("No blocks removed");
        } else {
            tracing::info!("Removed {} blocks", reorg.blocks.len());
            self.reorgs.save(&reorg).await?;
            self.blocks.revert(reorg_height).await?;
        }

        let new_last_hash = self.blocks.last_hash().await;
        if new_last_hash != *prev_hash {
            return Err(StorageError::InconsistentState(format!(
                "Revert failed to produce correct last hash: {}",
                new_last_hash
            ))
            .into());
        }
        state.set_last_hash(new_last_hash);

        let reverted: Vec<Hash32> = reorg.txids().copied().collect();
        for txid in &reverted {
            self.txs.add(*txid, true, false, None).await?;
        }
        self.events.add_reverted(reverted).await;
        Ok(())
    }

    /// Before the start block is found headers are only recorded. Returns whether the
    /// header's block should be downloaded.
    async fn check_start_height(&self, state: &mut SyncState, header: &BlockHeader) -> Result<bool> {
        if state.start_height.is_some() {
            return Ok(true);
        }

        let hash = header.block_hash();
        if hash == self.config.start_hash {
            let height = self.blocks.last_height().await + 1;
            tracing::info!(height, "Found start block");
            state.start_height = Some(height);
            state.set_last_hash(header.prev_blockhash);
            return Ok(true);
        }

        self.blocks.add(header).await?;
        state.set_last_hash(hash);
        Ok(false)
    }
}

fn request_block(
    state: &mut SyncState,
    header: &BlockHeader,
    hash: Hash32,
    requests: &mut Vec<Inventory>,
) {
    match state.add_block_request(&header.prev_blockhash, hash) {
        Ok(true) => requests.push(Inventory::Block(hash)),
        Ok(false) => {}
        Err(e) => tracing::warn!(previous_hash = %header.prev_blockhash, "Block not requested: {}", e),
    }
}
