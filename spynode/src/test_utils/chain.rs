use std::sync::Arc;

use crate::storage::{BlockRepository, MemoryStorage};
use crate::wire::transaction::COINBASE_INDEX;
use crate::wire::{Block, BlockHeader, Hash32, Network, OutPoint, Transaction, TxIn, TxOut};

/// A header linked to `prev`. The nonce keeps siblings distinct.
pub fn next_header(prev: &BlockHeader, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_blockhash: prev.block_hash(),
        merkle_root: Hash32::hash(&nonce.to_le_bytes()),
        time: prev.time + 600,
        bits: prev.bits,
        nonce,
    }
}

/// A regtest repository holding `length` headers above genesis. `headers[h]` is the header at
/// height `h`.
pub async fn chain_of(length: u32) -> (BlockRepository, Vec<BlockHeader>) {
    let blocks = BlockRepository::new(Arc::new(MemoryStorage::new()), Network::Regtest);
    blocks.load().await.unwrap();

    let mut headers = vec![Network::Regtest.genesis_header()];
    for height in 1..=length {
        let header = next_header(&headers[height as usize - 1], height);
        blocks.add(&header).await.unwrap();
        headers.push(header);
    }
    (blocks, headers)
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(hash);
    script.extend([0x88, 0xac]);
    script
}

/// A transaction paying to a public key hash. `seed` selects the spent outpoint.
pub fn tx_paying(hash: &[u8; 20], seed: u32) -> Transaction {
    tx_spending(OutPoint::new(Hash32::hash(&seed.to_le_bytes()), 0), hash)
}

pub fn tx_spending(outpoint: OutPoint, hash: &[u8; 20]) -> Transaction {
    Transaction {
        version: 1,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: vec![0x01, 0x01],
            sequence: 0xffffffff,
        }],
        output: vec![TxOut {
            value: 1_000,
            script_pubkey: p2pkh_script(hash),
        }],
        lock_time: 0,
    }
}

pub fn coinbase(height: u32) -> Transaction {
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

/// A block on top of `prev` with a coinbase followed by `txs` and a correct merkle root.
pub fn block_on(prev: &BlockHeader, nonce: u32, txs: Vec<Transaction>) -> Block {
    let mut txdata = vec![coinbase(nonce)];
    txdata.extend(txs);
    let mut block = Block {
        header: next_header(prev, nonce),
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}
