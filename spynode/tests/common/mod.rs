//! Scripted trusted peer and recording handler for integration testing.
//!
//! The peer listens on a local port and answers the node the way a full node would. It
//! completes the handshake and serves headers following the request locator from a fixed
//! chain. Blocks and transactions are returned on request. It pings every 50 ms so the node
//! keeps checking its sync progress.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use spynode::network::outgoing::build_version_msg;
use spynode::network::{MessageReader, MessageWriter};
use spynode::wire::transaction::COINBASE_INDEX;
use spynode::wire::{Inventory, NetworkMessage, TxIn};
use spynode::{
    Block, BlockHeader, Handler, HandlerError, Hash32, Headers, MessagePayload, Network, OutPoint,
    OutputFetcher, Transaction, Tx, TxOut, TxUpdate, Utxo,
};

pub const PING_INTERVAL: Duration = Duration::from_millis(50);

/// Blocks and transactions the peer serves.
#[derive(Default)]
pub struct PeerScript {
    pub blocks: Vec<Block>,
    pub txs: Vec<Transaction>,
}

/// A running scripted peer.
pub struct FakePeer {
    pub address: String,
    /// Every message received from the node, in order.
    pub received: Arc<Mutex<Vec<NetworkMessage>>>,
    send: mpsc::Sender<NetworkMessage>,
    task: JoinHandle<()>,
}

impl FakePeer {
    /// Binds a local port and serves the first connection.
    pub async fn start(script: PeerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local address").to_string();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (send, announcements) = mpsc::channel(16);

        let task = tokio::spawn(serve(listener, script, received.clone(), announcements));
        Self {
            address,
            received,
            send,
            task,
        }
    }

    /// Sends a message to the node.
    pub async fn send(&self, message: NetworkMessage) {
        self.send.send(message).await.expect("peer task ended");
    }

    pub async fn received_commands(&self) -> Vec<String> {
        self.received.lock().await.iter().map(|message| message.command().to_string()).collect()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    script: PeerScript,
    received: Arc<Mutex<Vec<NetworkMessage>>>,
    mut announcements: mpsc::Receiver<NetworkMessage>,
) {
    let Ok((stream, remote)) = listener.accept().await else {
        return;
    };
    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(read_half, Network::Regtest, remote.to_string());
    let mut writer = MessageWriter::new(write_half, Network::Regtest, remote.to_string());

    // Reads run in their own task so a partial message is never dropped by the select.
    let (incoming_tx, mut incoming) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Ok(message) = reader.read_message().await {
            if incoming_tx.send(message).await.is_err() {
                return;
            }
        }
    });

    let blocks: HashMap<Hash32, Block> =
        script.blocks.iter().map(|block| (block.block_hash(), block.clone())).collect();
    let txs: HashMap<Hash32, Transaction> =
        script.txs.iter().map(|tx| (tx.txid(), tx.clone())).collect();
    let headers: Vec<BlockHeader> = script.blocks.iter().map(|block| block.header).collect();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut nonce = 0u64;

    loop {
        let responses = tokio::select! {
            message = incoming.recv() => {
                let Some(message) = message else {
                    return;
                };
                received.lock().await.push(message.clone());
                respond(message, &blocks, &txs, &headers)
            }
            Some(message) = announcements.recv() => vec![message],
            _ = ping.tick() => {
                nonce += 1;
                vec![NetworkMessage::Ping(nonce)]
            }
        };

        for response in responses {
            if writer.write_message(response).await.is_err() {
                return;
            }
        }
    }
}

fn respond(
    message: NetworkMessage,
    blocks: &HashMap<Hash32, Block>,
    txs: &HashMap<Hash32, Transaction>,
    headers: &[BlockHeader],
) -> Vec<NetworkMessage> {
    match message {
        NetworkMessage::Version(_) => {
            vec![build_version_msg("/fake:0.1/", headers.len() as u32), NetworkMessage::Verack]
        }
        NetworkMessage::Ping(nonce) => vec![NetworkMessage::Pong(nonce)],
        NetworkMessage::GetHeaders(request) => {
            // Headers following the most recent locator hash on the served chain.
            let genesis = Network::Regtest.genesis_header().block_hash();
            let start = request.locator_hashes.iter().find_map(|hash| {
                if *hash == genesis {
                    Some(0)
                } else {
                    headers.iter().position(|header| header.block_hash() == *hash).map(|i| i + 1)
                }
            });
            let start = start.unwrap_or(0);
            vec![NetworkMessage::Headers(headers[start..].to_vec())]
        }
        NetworkMessage::GetData(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Inventory::Block(hash) => blocks.get(&hash).cloned().map(NetworkMessage::Block),
                Inventory::Transaction(txid) => txs.get(&txid).cloned().map(NetworkMessage::Tx),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Records notifications.
#[derive(Default)]
pub struct Recorder {
    pub txs: Mutex<Vec<Tx>>,
    pub updates: Mutex<Vec<TxUpdate>>,
    pub headers: Mutex<Vec<Headers>>,
    pub in_sync: Mutex<usize>,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle_tx(&self, tx: &Tx) {
        self.txs.lock().await.push(tx.clone());
    }

    async fn handle_tx_update(&self, update: &TxUpdate) {
        self.updates.lock().await.push(update.clone());
    }

    async fn handle_headers(&self, headers: &Headers) {
        self.headers.lock().await.push(headers.clone());
    }

    async fn handle_in_sync(&self) {
        *self.in_sync.lock().await += 1;
    }

    async fn handle_message(&self, _payload: &MessagePayload) {}
}

/// Returns a 10 000 satoshi output for every outpoint.
pub struct FixedOutputs;

#[async_trait]
impl OutputFetcher for FixedOutputs {
    async fn get_outputs(&self, outpoints: &[OutPoint]) -> Result<Vec<Utxo>, HandlerError> {
        Ok(outpoints
            .iter()
            .map(|outpoint| Utxo {
                hash: outpoint.txid,
                index: outpoint.vout,
                value: 10_000,
                locking_script: vec![0x51],
            })
            .collect())
    }
}

/// Polls `check` until it returns true or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(hash);
    script.extend([0x88, 0xac]);
    script
}

pub fn payment(hash: &[u8; 20], seed: u32) -> Transaction {
    Transaction {
        version: 1,
        input: vec![TxIn {
            previous_output: OutPoint::new(Hash32::hash(&seed.to_le_bytes()), 0),
            script_sig: vec![0x01, 0x01],
            sequence: 0xffffffff,
        }],
        output: vec![TxOut {
            value: 9_000,
            script_pubkey: p2pkh_script(hash),
        }],
        lock_time: 0,
    }
}

fn coinbase(height: u32) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend(height.to_le_bytes());
    Transaction {
        version: 1,
        input: vec![TxIn {
            previous_output: OutPoint::new(Hash32::all_zeros(), COINBASE_INDEX),
            script_sig,
            sequence: 0xffffffff,
        }],
        output: vec![TxOut {
            value: 50_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Builds `count` regtest blocks above genesis. `txs[i]` go into block `i + 1`.
pub fn regtest_chain(count: u32, mut txs: Vec<Vec<Transaction>>) -> Vec<Block> {
    txs.resize(count as usize, Vec::new());
    let mut prev = Network::Regtest.genesis_header();
    let mut blocks = Vec::new();
    for (i, block_txs) in txs.into_iter().enumerate() {
        let height = i as u32 + 1;
        let mut txdata = vec![coinbase(height)];
        txdata.extend(block_txs);
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_blockhash: prev.block_hash(),
                merkle_root: Hash32::all_zeros(),
                time: prev.time + 600,
                bits: prev.bits,
                nonce: height,
            },
            txdata,
        };
        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }
        prev = block.header;
        blocks.push(block);
    }
    blocks
}
