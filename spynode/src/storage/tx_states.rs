//! Relevant transactions with their spent outputs and last reported state.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use super::{Storage, read_optional, remove_if_exists};
use crate::error::{StorageError, StorageResult, WireResult};
use crate::handler::{Tx, TxState};
use crate::merkle::MerkleProof;
use crate::wire::{BlockHeader, Decodable, Encodable, Hash32, Transaction};

const TX_STATE_VERSION: u8 = 0;

fn tx_state_key(txid: &Hash32) -> String {
    format!("spynode/tx_states/{}", txid)
}

fn write_proof<W: Write + ?Sized>(proof: &MerkleProof, w: &mut W) -> io::Result<()> {
    proof.index.consensus_encode(w)?;
    proof.txid.consensus_encode(w)?;
    (proof.path.len() as u32).consensus_encode(w)?;
    for hash in &proof.path {
        hash.consensus_encode(w)?;
    }
    (proof.duplicated_indexes.len() as u32).consensus_encode(w)?;
    for index in &proof.duplicated_indexes {
        index.consensus_encode(w)?;
    }
    match &proof.block_header {
        Some(header) => {
            true.consensus_encode(w)?;
            header.consensus_encode(w)?;
        }
        None => {
            false.consensus_encode(w)?;
        }
    }
    Ok(())
}

fn read_proof<R: Read + ?Sized>(r: &mut R) -> WireResult<MerkleProof> {
    let index = u64::consensus_decode(r)?;
    let txid = Hash32::consensus_decode(r)?;
    let count = u32::consensus_decode(r)?;
    let mut path = Vec::new();
    for _ in 0..count {
        path.push(Hash32::consensus_decode(r)?);
    }
    let count = u32::consensus_decode(r)?;
    let mut duplicated_indexes = Vec::new();
    for _ in 0..count {
        duplicated_indexes.push(u32::consensus_decode(r)?);
    }
    let block_header = if bool::consensus_decode(r)? {
        Some(BlockHeader::consensus_decode(r)?)
    } else {
        None
    };
    Ok(MerkleProof {
        index,
        txid,
        path,
        duplicated_indexes,
        block_header,
    })
}

fn encode_tx(tx: &Tx) -> io::Result<Vec<u8>> {
    let mut data = vec![TX_STATE_VERSION];
    tx.tx.consensus_encode(&mut data)?;
    (tx.outputs.len() as u32).consensus_encode(&mut data)?;
    for output in &tx.outputs {
        output.consensus_encode(&mut data)?;
    }

    let state = &tx.state;
    state.safe.consensus_encode(&mut data)?;
    state.unsafe_.consensus_encode(&mut data)?;
    state.cancelled.consensus_encode(&mut data)?;
    state.unconfirmed_depth.consensus_encode(&mut data)?;
    match &state.merkle_proof {
        Some(proof) => {
            true.consensus_encode(&mut data)?;
            write_proof(proof, &mut data)?;
        }
        None => {
            false.consensus_encode(&mut data)?;
        }
    }
    Ok(data)
}

fn decode_tx(key: &str, data: &[u8]) -> StorageResult<Tx> {
    let mut r = Cursor::new(data);
    let version = u8::consensus_decode(&mut r)?;
    if version != TX_STATE_VERSION {
        return Err(StorageError::UnsupportedVersion {
            key: key.to_string(),
            version: version as u32,
        });
    }

    let tx = Transaction::consensus_decode(&mut r)?;
    let count = u32::consensus_decode(&mut r)?;
    let mut outputs = Vec::new();
    for _ in 0..count {
        outputs.push(Decodable::consensus_decode(&mut r)?);
    }

    let safe = bool::consensus_decode(&mut r)?;
    let unsafe_ = bool::consensus_decode(&mut r)?;
    let cancelled = bool::consensus_decode(&mut r)?;
    let unconfirmed_depth = u32::consensus_decode(&mut r)?;
    let merkle_proof = if bool::consensus_decode(&mut r)? {
        Some(read_proof(&mut r)?)
    } else {
        None
    };

    Ok(Tx {
        tx,
        outputs,
        state: TxState {
            safe,
            unsafe_,
            cancelled,
            unconfirmed_depth,
            merkle_proof,
        },
    })
}

/// Stores one [`Tx`] record per relevant transaction.
pub struct TxStateRepository {
    store: Arc<dyn Storage>,
}

impl TxStateRepository {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
        }
    }

    /// `None` when the transaction was never saved.
    pub async fn fetch(&self, txid: &Hash32) -> StorageResult<Option<Tx>> {
        let key = tx_state_key(txid);
        match read_optional(self.store.as_ref(), &key).await? {
            Some(data) => decode_tx(&key, &data).map(Some),
            None => Ok(None),
        }
    }

    pub async fn save(&self, tx: &Tx) -> StorageResult<()> {
        let data = encode_tx(tx)?;
        self.store.write(&tx_state_key(&tx.tx.txid()), &data).await
    }

    pub async fn remove(&self, txid: &Hash32) -> StorageResult<()> {
        remove_if_exists(self.store.as_ref(), &tx_state_key(txid)).await
    }
}
