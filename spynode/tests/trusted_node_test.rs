//! Integration tests driving a node against a scripted trusted peer.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{FakePeer, FixedOutputs, PeerScript, Recorder, payment, regtest_chain, wait_for};
use spynode::wire::{Inventory, NetworkMessage};
use spynode::{Config, DiskStorage, Node, Result};

const WATCHED: [u8; 20] = [7u8; 20];
const WAIT: Duration = Duration::from_secs(10);

struct Running {
    node: Arc<Node>,
    recorder: Arc<Recorder>,
    run: tokio::task::JoinHandle<Result<()>>,
}

async fn start_node(peer: &FakePeer, dir: &Path) -> Running {
    let config = Config::regtest(peer.address.clone())
        .with_untrusted_count(0)
        .with_request_mempool(false)
        .with_retries(2, Duration::from_millis(100))
        .with_storage_path(dir);
    let storage = Arc::new(DiskStorage::new(dir).unwrap());
    let node = Arc::new(Node::new(config, storage, None, Some(Arc::new(FixedOutputs))).unwrap());

    let recorder = Arc::new(Recorder::default());
    node.register_handler(recorder.clone()).await;
    node.subscribe_push_datas(&[WATCHED.to_vec()]).await;

    let run = tokio::spawn(node.clone().run());
    Running { node, recorder, run }
}
async fn stop(running: Running) {
    running.node.stop().await;
    let result = tokio::time::timeout(WAIT, running.run).await.expect("node did not stop");
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn test_sync_with_empty_chain() {
    let peer = FakePeer::start(PeerScript::default()).await;
    let dir = TempDir::new().unwrap();
    let running = start_node(&peer, dir.path()).await;

    let recorder = running.recorder.clone();
    assert!(wait_for(WAIT, || async { *recorder.in_sync.lock().await == 1 }).await);
    assert!(running.node.is_ready().await);
    assert_eq!(running.node.last_height().await, 0);

    let commands = peer.received_commands().await;
    assert_eq!(commands.first().map(String::as_str), Some("version"));
    assert!(commands.iter().any(|command| command == "verack"));
    assert!(commands.iter().any(|command| command == "getheaders"));
    assert!(commands.iter().any(|command| command == "sendheaders"));
    assert!(!commands.iter().any(|command| command == "mempool"));

    stop(running).await;
    peer.shutdown();
}

#[tokio::test]
async fn test_blocks_downloaded_and_relevant_tx_confirmed() {
    let relevant = payment(&WATCHED, 1);
    let blocks = regtest_chain(3, vec![vec![], vec![payment(&[9u8; 20], 2), relevant.clone()]]);
    let tip = blocks[2].block_hash();
    let peer = FakePeer::start(PeerScript {
        blocks,
        txs: Vec::new(),
    })
    .await;
    let dir = TempDir::new().unwrap();
    let running = start_node(&peer, dir.path()).await;

    let recorder = running.recorder.clone();
    assert!(wait_for(WAIT, || async { *recorder.in_sync.lock().await == 1 }).await);
    assert!(wait_for(WAIT, || async { !recorder.txs.lock().await.is_empty() }).await);
    assert_eq!(running.node.last_height().await, 3);
    assert_eq!(running.node.block_hash(-1).await.unwrap(), tip);

    let txs = recorder.txs.lock().await.clone();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].tx.txid(), relevant.txid());
    assert_eq!(txs[0].outputs[0].value, 10_000);
    let proof = txs[0].state.merkle_proof.as_ref().expect("proof");
    assert!(proof.verify());
    assert_eq!(proof.index, 2);

    stop(running).await;
    peer.shutdown();
}

#[tokio::test]
async fn test_announced_tx_requested_and_reported() {
    let relevant = payment(&WATCHED, 3);
    let peer = FakePeer::start(PeerScript {
        blocks: Vec::new(),
        txs: vec![relevant.clone()],
    })
    .await;
    let dir = TempDir::new().unwrap();
    let running = start_node(&peer, dir.path()).await;

    let recorder = running.recorder.clone();
    assert!(wait_for(WAIT, || async { *recorder.in_sync.lock().await == 1 }).await);

    peer.send(NetworkMessage::Inv(vec![Inventory::Transaction(relevant.txid())])).await;
    assert!(wait_for(WAIT, || async { !recorder.txs.lock().await.is_empty() }).await);

    let txs = recorder.txs.lock().await.clone();
    assert_eq!(txs[0].tx, relevant);
    assert!(!txs[0].state.is_confirmed());
    assert_eq!(txs[0].state.unconfirmed_depth, 1);

    let received = peer.received.lock().await.clone();
    assert!(received.contains(&NetworkMessage::GetData(vec![Inventory::Transaction(relevant.txid())])));

    stop(running).await;
    peer.shutdown();
}

#[tokio::test]
async fn test_restart_resumes_without_repeating_notifications() {
    let relevant = payment(&WATCHED, 4);
    let blocks = regtest_chain(2, vec![vec![relevant.clone()]]);
    let dir = TempDir::new().unwrap();

    let peer = FakePeer::start(PeerScript {
        blocks: blocks.clone(),
        txs: Vec::new(),
    })
    .await;
    let running = start_node(&peer, dir.path()).await;
    let recorder = running.recorder.clone();
    assert!(wait_for(WAIT, || async { recorder.txs.lock().await.len() == 1 }).await);
    stop(running).await;
    peer.shutdown();

    let peer = FakePeer::start(PeerScript {
        blocks,
        txs: Vec::new(),
    })
    .await;
    let running = start_node(&peer, dir.path()).await;
    let recorder = running.recorder.clone();
    assert!(wait_for(WAIT, || async { *recorder.in_sync.lock().await == 1 }).await);
    assert_eq!(running.node.last_height().await, 2);
    assert!(recorder.txs.lock().await.is_empty());

    let commands = peer.received_commands().await;
    assert!(!commands.iter().any(|command| command == "getdata"));

    stop(running).await;
    peer.shutdown();
}
