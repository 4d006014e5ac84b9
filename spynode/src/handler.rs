//! Notification interface between the node and the applications built on it.
//!
//! Applications implement [`Handler`] to receive relevant transactions, state updates for
//! them, new headers and the in-sync signal. [`TxFetcher`] and [`OutputFetcher`] let the
//! node resolve data it does not hold locally.

use async_trait::async_trait;
use thiserror::Error;

use crate::merkle::MerkleProof;
use crate::wire::{BlockHeader, Hash32, OutPoint, Transaction, TxOut};

/// Height reported for transactions that are not in a block.
pub const UNCONFIRMED_BLOCK_HEIGHT: u32 = u32::MAX;

/// Errors reported by handlers and by the node's client facing operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Unknown message type")]
    UnknownMessageType,

    #[error("Invalid: {0}")]
    Invalid(String),

    /// The merkle proof does not cover the whole path.
    #[error("Incomplete")]
    Incomplete,

    /// The merkle proof does not lead to the header's root.
    #[error("Wrong hash")]
    WrongHash,

    #[error("Not connected")]
    NotConnected,

    #[error("Timeout")]
    Timeout,

    #[error("Reject: {0}")]
    Reject(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),
}

/// Receives node notifications. Handlers are called in registration order.
#[async_trait]
pub trait Handler: Send + Sync {
    /// A relevant transaction seen for the first time.
    async fn handle_tx(&self, tx: &Tx);

    /// A new state for a relevant transaction reported before.
    async fn handle_tx_update(&self, update: &TxUpdate);

    async fn handle_headers(&self, headers: &Headers);

    /// The node caught up with the network. Sent once, the first time the node is ready.
    async fn handle_in_sync(&self);

    async fn handle_message(&self, payload: &MessagePayload);
}

/// Fetches transactions the node does not have stored.
#[async_trait]
pub trait TxFetcher: Send + Sync {
    async fn get_tx(&self, txid: Hash32) -> Result<Transaction, HandlerError>;
}

/// Fetches the outputs being spent by transactions.
#[async_trait]
pub trait OutputFetcher: Send + Sync {
    async fn get_outputs(&self, outpoints: &[OutPoint]) -> Result<Vec<Utxo>, HandlerError>;
}

/// A relevant transaction with the outputs its inputs spend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tx {
    pub tx: Transaction,
    /// One entry per input, in input order.
    pub outputs: Vec<TxOut>,
    pub state: TxState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxUpdate {
    pub txid: Hash32,
    pub state: TxState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    /// Height asked for, zero when not a response to a request.
    pub request_height: i32,
    /// Height of the first header. The others follow consecutively.
    pub start_height: u32,
    pub headers: Vec<BlockHeader>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxState {
    /// Survived the safety delay without a conflict.
    pub safe: bool,
    /// A double spend or other unsafe attribute was seen.
    pub unsafe_: bool,
    /// A conflicting transaction was confirmed.
    pub cancelled: bool,
    pub unconfirmed_depth: u32,
    pub merkle_proof: Option<MerkleProof>,
}

impl TxState {
    pub fn is_confirmed(&self) -> bool {
        self.merkle_proof.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessagePayload {
    /// Sent after every connect to the trusted node.
    AcceptRegister(AcceptRegister),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptRegister {
    pub push_data_count: u64,
    pub utxo_count: u64,
    pub message_count: u64,
}

/// An unspent output as returned by an [`OutputFetcher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub hash: Hash32,
    pub index: u32,
    pub value: u64,
    pub locking_script: Vec<u8>,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.hash, self.index)
    }

    pub fn to_tx_out(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.locking_script.clone(),
        }
    }
}

/// Checks a merkle proof against the header it carries.
pub fn verify_merkle_proof(proof: &MerkleProof) -> Result<(), HandlerError> {
    let header = proof.block_header.as_ref().ok_or(HandlerError::Incomplete)?;
    if proof.path.len() < 64 && (proof.index >> proof.path.len()) != 0 {
        return Err(HandlerError::Incomplete);
    }
    if proof.root() != header.merkle_root {
        return Err(HandlerError::WrongHash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleTree;
    use crate::wire::Network;

    fn proof_for(index: usize, count: u8) -> MerkleProof {
        let leaves: Vec<Hash32> = (0..count).map(|i| Hash32::hash(&[i, 7])).collect();
        let mut tree = MerkleTree::new();
        tree.add_merkle_proof(leaves[index]);
        for leaf in &leaves {
            tree.add_hash(*leaf);
        }
        let (root, mut proofs) = tree.finalize_merkle_proofs();
        let mut header = Network::Regtest.genesis_header();
        header.merkle_root = root.unwrap();
        let mut proof = proofs.remove(0);
        proof.block_header = Some(header);
        proof
    }

    #[test]
    fn test_verify_merkle_proof() {
        let proof = proof_for(4, 9);
        assert_eq!(verify_merkle_proof(&proof), Ok(()));

        let mut wrong = proof.clone();
        wrong.txid = Hash32::hash(b"other");
        assert_eq!(verify_merkle_proof(&wrong), Err(HandlerError::WrongHash));

        let mut short = proof.clone();
        short.path.pop();
        assert_eq!(verify_merkle_proof(&short), Err(HandlerError::Incomplete));

        let mut headerless = proof;
        headerless.block_header = None;
        assert_eq!(verify_merkle_proof(&headerless), Err(HandlerError::Incomplete));
    }

    #[test]
    fn test_utxo_conversions() {
        let utxo = Utxo {
            hash: Hash32::hash(b"parent"),
            index: 3,
            value: 1_000,
            locking_script: vec![0x76, 0xa9],
        };
        assert_eq!(utxo.outpoint(), OutPoint::new(Hash32::hash(b"parent"), 3));
        assert_eq!(utxo.to_tx_out().value, 1_000);
        assert_eq!(utxo.to_tx_out().script_pubkey, vec![0x76, 0xa9]);
    }
}
