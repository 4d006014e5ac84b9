//! Merkle root calculation and inclusion proofs.
//!
//! A [`MerkleTree`] is fed every transaction hash of a block in order. Hashes that were
//! flagged with [`MerkleTree::add_merkle_proof`] before being added get a proof when the
//! tree is finalized.

use std::collections::HashSet;

use crate::wire::hashes::sha256d;
use crate::wire::{BlockHeader, Hash32};

/// Proof that a transaction is included under a block's merkle root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    /// Position of the transaction in the block.
    pub index: u64,
    pub txid: Hash32,
    /// Sibling hashes from the leaf level up to just below the root.
    pub path: Vec<Hash32>,
    /// Levels of `path` where the node was paired with itself.
    pub duplicated_indexes: Vec<u32>,
    /// Header of the containing block, set once the block is accepted.
    pub block_header: Option<BlockHeader>,
}

impl MerkleProof {
    /// Recomputes the merkle root from the proof.
    pub fn root(&self) -> Hash32 {
        let mut hash = self.txid;
        let mut index = self.index;
        for sibling in &self.path {
            hash = if index & 1 == 0 {
                hash_pair(&hash, sibling)
            } else {
                hash_pair(sibling, &hash)
            };
            index >>= 1;
        }
        hash
    }

    /// True when the proof leads to the merkle root of its block header.
    pub fn verify(&self) -> bool {
        match &self.block_header {
            Some(header) => self.root() == header.merkle_root,
            None => false,
        }
    }
}

fn hash_pair(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&left.0);
    data[32..].copy_from_slice(&right.0);
    Hash32(sha256d(&data))
}

/// Computes the merkle root of a list of hashes. `None` for an empty list.
pub fn calculate_root<I: IntoIterator<Item = Hash32>>(hashes: I) -> Option<Hash32> {
    let mut level: Vec<Hash32> = hashes.into_iter().collect();
    if level.is_empty() {
        return None;
    }
    while level.len() > 1 {
        level = next_level(&level);
    }
    Some(level[0])
}

fn next_level(level: &[Hash32]) -> Vec<Hash32> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Accumulates the hashes of a block and builds proofs for selected transactions.
#[derive(Debug, Default)]
pub struct MerkleTree {
    hashes: Vec<Hash32>,
    wanted: HashSet<Hash32>,
    proof_indexes: Vec<usize>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a proof for `txid`. Must be called before the hash is added.
    pub fn add_merkle_proof(&mut self, txid: Hash32) {
        self.wanted.insert(txid);
    }

    pub fn add_hash(&mut self, hash: Hash32) {
        if self.wanted.remove(&hash) {
            self.proof_indexes.push(self.hashes.len());
        }
        self.hashes.push(hash);
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Computes the root and the requested proofs, in the order the hashes were added.
    pub fn finalize_merkle_proofs(self) -> (Option<Hash32>, Vec<MerkleProof>) {
        if self.hashes.is_empty() {
            return (None, Vec::new());
        }

        let mut proofs: Vec<MerkleProof> = self
            .proof_indexes
            .iter()
            .map(|&index| MerkleProof {
                index: index as u64,
                txid: self.hashes[index],
                path: Vec::new(),
                duplicated_indexes: Vec::new(),
                block_header: None,
            })
            .collect();
        let mut positions = self.proof_indexes.clone();

        let mut level = self.hashes;
        let mut depth = 0u32;
        while level.len() > 1 {
            let last = level.len() - 1;
            for (proof, position) in proofs.iter_mut().zip(positions.iter_mut()) {
                let sibling = *position ^ 1;
                if sibling > last {
                    proof.path.push(level[*position]);
                    proof.duplicated_indexes.push(depth);
                } else {
                    proof.path.push(level[sibling]);
                }
                *position >>= 1;
            }
            level = next_level(&level);
            depth += 1;
        }

        (Some(level[0]), proofs)
    }
}
