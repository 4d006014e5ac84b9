//! Block headers and blocks.

use std::io::{self, Read, Write};

use crate::error::WireResult;
use crate::merkle;
use crate::wire::encode::{serialize, Decodable, Encodable};
use crate::wire::hashes::Hash32;
use crate::wire::transaction::Transaction;

/// Serialized size of a block header.
pub const HEADER_SIZE: usize = 80;

/// An 80 byte block header.
#[derive(Copy, PartialEq, Eq, Clone, Debug, Hash)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: Hash32,
    pub merkle_root: Hash32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn block_hash(&self) -> Hash32 {
        Hash32::hash(&serialize(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += self.prev_blockhash.consensus_encode(w)?;
        len += self.merkle_root.consensus_encode(w)?;
        len += self.time.consensus_encode(w)?;
        len += self.bits.consensus_encode(w)?;
        len += self.nonce.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(BlockHeader {
            version: Decodable::consensus_decode(r)?,
            prev_blockhash: Decodable::consensus_decode(r)?,
            merkle_root: Decodable::consensus_decode(r)?,
            time: Decodable::consensus_decode(r)?,
            bits: Decodable::consensus_decode(r)?,
            nonce: Decodable::consensus_decode(r)?,
        })
    }
}

/// A full block.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub txdata: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> Hash32 {
        self.header.block_hash()
    }

    /// Computes the merkle root of the block's transactions.
    pub fn compute_merkle_root(&self) -> Option<Hash32> {
        merkle::calculate_root(self.txdata.iter().map(Transaction::txid))
    }

    /// Checks the header's merkle root against the transaction list.
    pub fn check_merkle_root(&self) -> bool {
        self.compute_merkle_root() == Some(self.header.merkle_root)
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        serialize(self).len()
    }
}

impl Encodable for Block {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.header.consensus_encode(w)? + self.txdata.consensus_encode(w)?)
    }
}

impl Decodable for Block {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        Ok(Block {
            header: Decodable::consensus_decode(r)?,
            txdata: Decodable::consensus_decode(r)?,
        })
    }
}
