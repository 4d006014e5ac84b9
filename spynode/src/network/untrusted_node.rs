//! Connection to an untrusted peer.
//!
//! Untrusted peers are never a source of chain state. After the handshake a peer proves it
//! follows the trusted chain by returning headers linked to our recent tip. Once verified it
//! receives pending broadcasts, is asked for its mempool and its addresses, and relays the
//! transactions it announces into the shared unconfirmed path as untrusted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{NetworkError, Result};
use crate::network::channel::MessageChannel;
use crate::network::connection::{self, TcpReader, TcpWriter};
use crate::network::constants::{
    CHANNEL_SIZE, UNTRUSTED_HEADER_DELTA, UNTRUSTED_LOCATOR_MAX, UNTRUSTED_TIMEOUT_INTERVAL,
    VERIFIED_SCORE,
};
use crate::network::outgoing::{build_header_request, build_version_msg};
use crate::network::{TxMessage, inventory_requests};
use crate::state::{MemPool, TxTracker, UntrustedState};
use crate::storage::{BlockRepository, PeerRepository};
use crate::wire::message::PROTOCOL_VERSION;
use crate::wire::{BlockHeader, Hash32, Inventory, Network, NetworkMessage, Transaction};

/// Resources untrusted nodes share with the trusted node.
#[derive(Clone)]
pub struct UntrustedContext {
    pub network: Network,
    pub user_agent: String,
    pub peers: Arc<PeerRepository>,
    pub blocks: Arc<BlockRepository>,
    pub mempool: Arc<MemPool>,
    pub txs: Arc<MessageChannel<TxMessage>>,
}

pub struct UntrustedNode {
    address: String,
    context: UntrustedContext,
    /// Stop as soon as the peer is verified.
    scanning: bool,
    state: Mutex<UntrustedState>,
    tracker: TxTracker,
    outgoing: MessageChannel<NetworkMessage>,
    pending: Mutex<Vec<Transaction>>,
    cancel: CancellationToken,
    active: AtomicBool,
    ready_announced: AtomicBool,
}

impl UntrustedNode {
    pub fn new(address: impl Into<String>, context: UntrustedContext, scanning: bool) -> Self {
        Self {
            address: address.into(),
            context,
            scanning,
            state: Mutex::new(UntrustedState::new()),
            tracker: TxTracker::new(),
            outgoing: MessageChannel::new("untrusted outgoing"),
            pending: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            active: AtomicBool::new(false),
            ready_announced: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connects and serves the peer until [`stop`](Self::stop) is called or the connection
    /// fails. A failed dial lowers the peer's score.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let (reader, writer) = match connection::connect(&self.address, self.context.network).await
        {
            Ok(halves) => halves,
            Err(e) => {
                self.context.peers.update_score(&self.address, -1).await;
                return Err(e.into());
            }
        };
        self.state.lock().await.mark_connected();
        self.context.peers.update_time(&self.address).await;

        let receiver = self.outgoing.open(CHANNEL_SIZE, self.cancel.clone()).await;
        self.active.store(true, Ordering::SeqCst);

        let version = build_version_msg(
            &self.context.user_agent,
            self.context.blocks.last_height().await,
        );
        if let Err(e) = self.outgoing.add(version).await {
            self.outgoing.close().await;
            self.active.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut incoming = JoinSet::new();
        let node = self.clone();
        incoming.spawn(async move { node.monitor_incoming(reader).await });
        let node = self.clone();
        incoming.spawn(async move { node.monitor_timeouts().await });

        let mut processing = JoinSet::new();
        let node = self.clone();
        processing.spawn(async move { node.send_outgoing(writer, receiver).await });

        self.cancel.cancelled().await;

        while incoming.join_next().await.is_some() {}
        self.outgoing.close().await;
        while processing.join_next().await.is_some() {}

        self.active.store(false, Ordering::SeqCst);
        tracing::debug!("({}) Untrusted node stopped", self.address);
        Ok(())
    }

    pub fn stop(&self) {
        self.tracker.stop();
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Connected and not yet fully stopped.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.is_ready()
    }

    /// Sends the transactions now if the peer is verified, otherwise once it is.
    pub async fn broadcast_txs(&self, txs: &[Transaction]) -> Result<()> {
        if txs.is_empty() {
            return Ok(());
        }
        if self.is_ready().await {
            for tx in txs {
                self.outgoing.add(NetworkMessage::Tx(tx.clone())).await?;
            }
        } else {
            self.pending.lock().await.extend_from_slice(txs);
        }
        Ok(())
    }

    /// Drops tracked announcements of transactions confirmed in a block.
    pub async fn cleanup_block(&self, txids: &[Hash32]) {
        self.tracker.remove_list(txids).await;
    }

    async fn monitor_incoming(&self, mut reader: TcpReader) {
        loop {
            match self.check().await {
                Ok(messages) => {
                    for message in messages {
                        if self.outgoing.add(message).await.is_err() {
                            self.stop();
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("({}) Check failed: {}", self.address, e);
                    self.stop();
                    return;
                }
            }
            if self.is_stopping() {
                return;
            }

            let message = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = reader.read_message() => result,
            };
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("({}) Read failed: {}", self.address, e);
                    self.stop();
                    return;
                }
            };

            if let NetworkMessage::Reject(reject) = &message {
                tracing::debug!(
                    "({}) Reject message: {} - {:?}",
                    self.address,
                    reject.reason,
                    reject.hash
                );
            }

            match self.handle_message(message).await {
                Ok(responses) => {
                    for response in responses {
                        if self.outgoing.add(response).await.is_err() {
                            self.stop();
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("({}) Failed to handle message: {}", self.address, e);
                    self.context.peers.update_score(&self.address, -1).await;
                    self.stop();
                    return;
                }
            }
        }
    }

    async fn monitor_timeouts(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(UNTRUSTED_TIMEOUT_INTERVAL) => {}
            }
            let result = self.state.lock().await.check_timeouts();
            if let Err(e) = result {
                tracing::debug!("({}) Timed out: {}", self.address, e);
                self.context.peers.update_score(&self.address, -1).await;
                self.stop();
                return;
            }
        }
    }

    async fn send_outgoing(&self, mut writer: TcpWriter, mut receiver: mpsc::Receiver<NetworkMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = receiver.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            if let Err(e) = writer.write_message(message).await {
                tracing::debug!("({}) Write failed: {}", self.address, e);
                self.stop();
                break;
            }
        }
        writer.shutdown().await;
    }

    /// Advances the handshake and returns the messages it calls for.
    pub(crate) async fn check(&self) -> Result<Vec<NetworkMessage>> {
        let mut messages = Vec::new();
        let mut state = self.state.lock().await;
        if !state.version_received {
            return Ok(messages);
        }

        if !state.handshake_complete {
            let request = build_header_request(
                state.protocol_version,
                &self.context.blocks,
                None,
                UNTRUSTED_HEADER_DELTA,
                UNTRUSTED_LOCATOR_MAX,
            )
            .await?;
            messages.push(request);
            state.mark_headers_requested();
            state.handshake_complete = true;
        }

        if !state.is_ready() {
            return Ok(messages);
        }

        if !self.ready_announced.swap(true, Ordering::SeqCst) {
            tracing::debug!("({}) Verified", self.address);
        }

        if !state.score_updated {
            self.context.peers.update_score(&self.address, VERIFIED_SCORE).await;
            state.score_updated = true;
        }

        if !state.addresses_requested {
            messages.push(NetworkMessage::GetAddr);
            state.addresses_requested = true;
        }

        if self.scanning {
            tracing::info!("({}) Found peer", self.address);
            self.stop();
            return Ok(messages);
        }

        let pending = std::mem::take(&mut *self.pending.lock().await);
        messages.extend(pending.into_iter().map(NetworkMessage::Tx));

        if !state.mempool_requested {
            messages.push(NetworkMessage::MemPool);
            state.mempool_requested = true;
        }
        drop(state);

        messages.extend(self.tracker.check(&self.context.mempool).await);
        Ok(messages)
    }

    pub(crate) async fn handle_message(&self, message: NetworkMessage) -> Result<Vec<NetworkMessage>> {
        match message {
            NetworkMessage::Ping(nonce) => Ok(vec![NetworkMessage::Pong(nonce)]),
            NetworkMessage::Version(version) => {
                let mut state = self.state.lock().await;
                state.version_received = true;
                state.protocol_version = version.version.min(PROTOCOL_VERSION);
                Ok(vec![NetworkMessage::Verack])
            }
            NetworkMessage::Addr(addresses) => {
                for entry in addresses {
                    self.context.peers.add(&entry.address.socket_addr().to_string()).await;
                }
                Ok(Vec::new())
            }
            NetworkMessage::Inv(items) => self.handle_inventory(items).await,
            NetworkMessage::Tx(tx) => {
                if self.is_ready().await {
                    self.context
                        .txs
                        .add(TxMessage {
                            tx,
                            trusted: false,
                            safe: false,
                        })
                        .await?;
                }
                Ok(Vec::new())
            }
            NetworkMessage::Headers(headers) => {
                self.verify_headers(&headers).await?;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn handle_inventory(&self, items: Vec<Inventory>) -> Result<Vec<NetworkMessage>> {
        if !self.is_ready().await {
            return Ok(Vec::new());
        }

        let mut requests = Vec::new();
        for item in items {
            if let Inventory::Transaction(txid) = item {
                let (already_have, should_request) =
                    self.context.mempool.add_request(txid, false).await;
                if already_have {
                    continue;
                }
                if should_request {
                    requests.push(item);
                } else {
                    self.tracker.add(txid).await;
                }
            }
        }
        Ok(inventory_requests(requests))
    }

    /// Verifies the peer against the trusted chain: the first header must be one of our
    /// recent blocks and the rest must link to it.
    async fn verify_headers(&self, headers: &[BlockHeader]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_ready() {
            return Ok(());
        }

        let first = headers
            .first()
            .ok_or_else(|| NetworkError::ProtocolError("Returned zero headers".to_string()))?;
        let hash = first.block_hash();
        let height = self
            .context
            .blocks
            .height(&hash)
            .await
            .ok_or_else(|| NetworkError::ProtocolError(format!("Returned unknown header {}", hash)))?;

        let last_height = self.context.blocks.last_height().await;
        if height < last_height.saturating_sub(UNTRUSTED_HEADER_DELTA + 1) {
            return Err(NetworkError::ProtocolError(format!(
                "Returned header at low height {}",
                height
            ))
            .into());
        }

        let mut previous = hash;
        for header in &headers[1..] {
            if header.prev_blockhash != previous {
                return Err(
                    NetworkError::ProtocolError("Returned unlinked headers".to_string()).into()
                );
            }
            previous = header.block_hash();
        }

        state.clear_headers_requested();
        state.verified = true;
        Ok(())
    }
}

impl std::fmt::Debug for UntrustedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UntrustedNode")
            .field("address", &self.address)
            .field("scanning", &self.scanning)
            .field("active", &self.is_active())
            .finish()
    }
}
