//! Node lifecycle management.
//!
//! This module contains:
//! - Constructor (`new`) and handler registration
//! - Loading of persisted state
//! - The reconnect loop (`run`) and shutdown (`stop`)
//! - The tasks of one trusted connection: reader, writer and request timeout monitor
//! - The periodic `check` that drives the handshake and sync requests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SpyNodeError};
use crate::handler::{AcceptRegister, Handler, MessagePayload, OutputFetcher, TxFetcher};
use crate::network::constants::{
    CHANNEL_SIZE, MAX_OUTSTANDING_FOR_HEADERS, REQUEST_TIMEOUT_INTERVAL, TRUSTED_LOCATOR_MAX,
};
use crate::network::outgoing::{build_header_request, build_version_msg};
use crate::network::{MessageChannel, MessageReader, MessageWriter, TxMessage, connect};
use crate::state::{MemPool, SyncState, TxTracker};
use crate::storage::{
    BlockRepository, PeerRepository, ReorgRepository, Storage, TxRepository, TxStateRepository,
};
use crate::wire::NetworkMessage;

use super::events::EventDispatcher;
use super::filter::Filter;
use super::refeeder::BlockRefeeder;
use super::{Config, Node};

impl Node {
    /// Creates a node over `store`. Nothing is loaded or dialed until [`run`](Node::run).
    pub fn new(
        config: Config,
        store: Arc<dyn Storage>,
        tx_fetcher: Option<Arc<dyn TxFetcher>>,
        output_fetcher: Option<Arc<dyn OutputFetcher>>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!("Creating node: {}", config);

        Ok(Self {
            peers: Arc::new(PeerRepository::new(store.clone())),
            blocks: Arc::new(BlockRepository::new(store.clone(), config.network)),
            txs: TxRepository::new(store.clone()),
            tx_states: TxStateRepository::new(store.clone()),
            reorgs: ReorgRepository::new(store.clone()),
            mempool: Arc::new(MemPool::new()),
            tracker: TxTracker::new(),
            state: Mutex::new(SyncState::new()),
            filter: RwLock::new(Filter::new()),
            events: EventDispatcher::new(store.clone()),
            refeeder: Mutex::new(BlockRefeeder::new()),
            tx_fetcher,
            output_fetcher,
            outgoing: MessageChannel::new("outgoing"),
            unconfirmed: Arc::new(MessageChannel::new("unconfirmed")),
            untrusted: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            addresses: Mutex::new(HashMap::new()),
            block_lock: Mutex::new(()),
            stop_token: RwLock::new(CancellationToken::new()),
            needs_restart: AtomicBool::new(false),
            hard_stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopped: Notify::new(),
            scanning: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            fatal: Mutex::new(None),
            config,
            store,
        })
    }

    /// Adds a handler. Handlers are notified in registration order.
    pub async fn register_handler(&self, handler: Arc<dyn Handler>) {
        self.events.register(handler).await;
    }

    /// Loads peers, headers, unconfirmed txs and the deferred notification state.
    pub(super) async fn load(&self) -> Result<()> {
        self.peers.load().await?;
        self.blocks.load().await?;

        let start_height = if self.config.start_hash.is_zero() {
            Some(0)
        } else {
            self.blocks.height(&self.config.start_hash).await
        };
        {
            let mut state = self.state.lock().await;
            state.set_last_hash(self.blocks.last_hash().await);
            state.start_height = start_height;
        }
        match start_height {
            Some(height) => tracing::info!(height, "Start block found"),
            None => tracing::info!(hash = %self.config.start_hash, "Start block not found yet"),
        }

        self.txs.load().await?;
        self.events.load().await?;
        Ok(())
    }

    /// Connects to the trusted node and keeps the connection up until [`stop`](Node::stop)
    /// is called or a fatal error occurs. Returns the first fatal error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SpyNodeError::General("Node is already running".to_string()));
        }

        let result = self.clone().run_connections().await;

        self.running.store(false, Ordering::SeqCst);
        self.stopped.notify_waiters();
        tracing::info!("Node stopped");
        result
    }

    async fn run_connections(self: Arc<Self>) -> Result<()> {
        self.load().await?;

        loop {
            if self.hard_stop.load(Ordering::SeqCst) {
                break;
            }
            let token = self.stop_token().await;
            if token.is_cancelled() {
                break;
            }

            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempts != 0 {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
                if token.is_cancelled() && !self.needs_restart.load(Ordering::SeqCst) {
                    break;
                }
            }
            if attempts > self.config.max_retries {
                tracing::error!("Trusted node connection retries exceeded: {}", attempts);
            }

            if !token.is_cancelled() {
                if let Err(e) = self.clone().run_connection(token.clone()).await {
                    tracing::warn!("Trusted node connection failed: {}", e);
                }
            }

            if self.hard_stop.load(Ordering::SeqCst) {
                break;
            }
            if token.is_cancelled() {
                if !self.needs_restart.swap(false, Ordering::SeqCst) {
                    break;
                }
                self.reset_connection_state().await;
                *self.stop_token.write().await = CancellationToken::new();
            }
        }

        match self.fatal.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Clears the per-connection sync flags and outstanding refeed request before a
    /// reconnect.
    pub(super) async fn reset_connection_state(&self) {
        let _block_lock = self.block_lock.lock().await;
        self.state.lock().await.reset();
        self.refeeder.lock().await.reset_request();
    }

    /// Serves one connection to the trusted node until its token is cancelled.
    async fn run_connection(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let (reader, writer) = connect(&self.config.node_address, self.config.network).await?;
        self.state.lock().await.mark_connected();
        self.peers.update_time(&self.config.node_address).await;
        self.tracker.resume();
        tracing::info!("Connected to trusted node {}", self.config.masked_address());

        self.serve(reader, writer, token).await
    }

    /// Runs the connection tasks over an established connection.
    ///
    /// The incoming group (reader, timeouts, untrusted pool) is joined first, then the
    /// channels are closed and the processing group drains them.
    pub(crate) async fn serve<R, W>(
        self: Arc<Self>,
        reader: MessageReader<R>,
        writer: MessageWriter<W>,
        token: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let outgoing = self.outgoing.open(CHANNEL_SIZE, token.clone()).await;
        let unconfirmed = self.unconfirmed.open(CHANNEL_SIZE, token.clone()).await;

        let version = build_version_msg(&self.config.user_agent, self.blocks.last_height().await);
        if let Err(e) = self.outgoing.add(version).await {
            self.outgoing.close().await;
            self.unconfirmed.close().await;
            return Err(e);
        }

        let mut incoming = JoinSet::new();
        let node = self.clone();
        incoming.spawn(async move { node.monitor_incoming(reader).await });
        let node = self.clone();
        incoming.spawn(async move { node.monitor_request_timeouts().await });
        if self.config.untrusted_count > 0 {
            let node = self.clone();
            incoming.spawn(async move { node.monitor_untrusted_nodes().await });
        }

        let mut processing = JoinSet::new();
        let node = self.clone();
        processing.spawn(async move { node.send_outgoing(writer, outgoing).await });
        let node = self.clone();
        processing.spawn(async move { node.process_blocks().await });
        let node = self.clone();
        processing.spawn(async move { node.process_unconfirmed_txs(unconfirmed).await });
        let node = self.clone();
        processing.spawn(async move { node.check_tx_delays().await });

        let accept = AcceptRegister {
            push_data_count: self.filter.read().await.push_data_count() as u64,
            utxo_count: 0,
            message_count: 0,
        };
        self.events.handle_message(&MessagePayload::AcceptRegister(accept)).await;

        token.cancelled().await;
        self.tracker.stop();

        while incoming.join_next().await.is_some() {}
        self.outgoing.close().await;
        self.unconfirmed.close().await;
        while processing.join_next().await.is_some() {}

        self.save().await;
        tracing::info!("Trusted node connection closed");
        Ok(())
    }

    async fn save(&self) {
        if let Err(e) = self.blocks.save().await {
            tracing::error!("Failed to save blocks: {}", e);
        }
        if let Err(e) = self.txs.save().await {
            tracing::error!("Failed to save txs: {}", e);
        }
        if let Err(e) = self.peers.save().await {
            tracing::error!("Failed to save peers: {}", e);
        }
        if let Err(e) = self.events.save().await {
            tracing::error!("Failed to save node state: {}", e);
        }
    }

    /// Stops the node and waits until [`run`](Node::run) returns.
    pub async fn stop(&self) {
        tracing::info!("Stopping node");
        self.hard_stop.store(true, Ordering::SeqCst);
        self.request_stop().await;

        loop {
            let stopped = self.stopped.notified();
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            stopped.await;
        }
    }

    async fn monitor_incoming<R: AsyncRead + Unpin>(&self, mut reader: MessageReader<R>) {
        let token = self.stop_token().await;
        loop {
            match self.check().await {
                Ok(messages) => {
                    for message in messages {
                        if self.outgoing.add(message).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Check failed: {}", e);
                    self.fail(e).await;
                    return;
                }
            }
            if token.is_cancelled() {
                return;
            }

            let message = tokio::select! {
                _ = token.cancelled() => return,
                result = reader.read_message() => result,
            };
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    if !token.is_cancelled() {
                        tracing::warn!("Failed to read trusted node message: {}", e);
                        self.restart().await;
                    }
                    return;
                }
            };

            if let NetworkMessage::Reject(reject) = &message {
                tracing::warn!(
                    "Reject message from trusted node: {} ({}) {:?}",
                    reject.reason,
                    reject.message,
                    reject.hash
                );
            }

            match self.handle_message(message).await {
                Ok(responses) => {
                    for response in responses {
                        if self.outgoing.add(response).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!("Failed to handle trusted node message: {}", e),
            }
        }
    }

    /// Writes queued messages. After a write failure the queue is still drained so producers
    /// never block on a dead connection.
    async fn send_outgoing<W: AsyncWrite + Unpin>(
        &self,
        mut writer: MessageWriter<W>,
        mut receiver: mpsc::Receiver<NetworkMessage>,
    ) {
        let mut failed = false;
        while let Some(message) = receiver.recv().await {
            if failed {
                continue;
            }
            if let Err(e) = writer.write_message(message).await {
                tracing::warn!("Failed to write to trusted node: {}", e);
                failed = true;
                self.restart().await;
            }
        }
        writer.shutdown().await;
        tracing::debug!("Sent {} bytes to trusted node", writer.bytes_sent());
    }

    async fn monitor_request_timeouts(&self) {
        let token = self.stop_token().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(REQUEST_TIMEOUT_INTERVAL) => {}
            }
            let result = self.state.lock().await.check_timeouts();
            if let Err(e) = result {
                tracing::warn!("Trusted node request timed out: {}", e);
                self.restart().await;
                return;
            }
        }
    }

    /// Advances the handshake and sync, returning the messages it calls for.
    pub(super) async fn check(&self) -> Result<Vec<NetworkMessage>> {
        let mut messages = Vec::new();
        let mut state = self.state.lock().await;
        if !state.version_received {
            return Ok(messages);
        }

        if !state.handshake_complete {
            let request = build_header_request(
                state.protocol_version,
                &self.blocks,
                state.block_request_hash(0),
                0,
                TRUSTED_LOCATOR_MAX,
            )
            .await?;
            tracing::debug!("Requesting headers");
            messages.push(request);
            state.mark_headers_requested();
            state.handshake_complete = true;
        }

        if !state.is_ready() {
            if state.headers_requested.is_none()
                && state.total_block_request_count() < MAX_OUTSTANDING_FOR_HEADERS
            {
                let request = build_header_request(
                    state.protocol_version,
                    &self.blocks,
                    state.block_request_hash(1),
                    1,
                    TRUSTED_LOCATOR_MAX,
                )
                .await?;
                tracing::debug!("Requesting more headers");
                messages.push(request);
                state.mark_headers_requested();
            }
            return Ok(messages);
        }

        self.attempts.store(0, Ordering::SeqCst);

        if !state.sent_send_headers {
            messages.push(NetworkMessage::SendHeaders);
            state.sent_send_headers = true;
        }
        if !state.addresses_requested {
            messages.push(NetworkMessage::GetAddr);
            state.addresses_requested = true;
        }

        if self.config.request_mempool && !state.mempool_requested {
            tracing::info!("Requesting mempool");
            messages.push(NetworkMessage::MemPool);
            state.mempool_requested = true;
        } else {
            let first_ready = !state.was_in_sync;
            state.was_in_sync = true;
            let notify = !state.notified_sync;
            state.notified_sync = true;
            drop(state);

            if first_ready {
                tracing::info!("In sync with trusted node");
                self.reorgs.clear_active().await?;
            }
            if notify {
                self.events.in_sync(&self.tx_states).await?;
                messages.extend(self.resume_broadcasts().await);
            }
            if first_ready {
                self.events.flush_reverted(&self.tx_states).await?;
            }
        }

        messages.extend(self.tracker.check(&self.mempool).await);
        Ok(messages)
    }
}
