//! Record of reorganizations: the blocks that were reverted and their relevant txids.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{Storage, read_optional};
use crate::error::{StorageResult, WireResult};
use crate::wire::{BlockHeader, Decodable, Encodable, Hash32};

const REORGS_PREFIX: &str = "spynode/reorgs/";
const ACTIVE_KEY: &str = "spynode/reorgs/active";

/// A reorg in progress or archived.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reorg {
    /// Height of the common ancestor.
    pub block_height: u32,
    /// Reverted blocks, lowest first.
    pub blocks: Vec<ReorgBlock>,
}

/// A reverted block. The txids alone do not prove inclusion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReorgBlock {
    pub header: BlockHeader,
    pub txids: Vec<Hash32>,
}

impl Reorg {
    /// SHA-256 of the little endian height followed by each block hash.
    pub fn id(&self) -> [u8; 32] {
        let mut digest = Sha256::new();
        digest.update(self.block_height.to_le_bytes());
        for block in &self.blocks {
            digest.update(block.header.block_hash().0);
        }
        digest.finalize().into()
    }

    /// Every txid of every reverted block.
    pub fn txids(&self) -> impl Iterator<Item = &Hash32> {
        self.blocks.iter().flat_map(|block| block.txids.iter())
    }
}

impl Encodable for Reorg {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.block_height.consensus_encode(w)?;
        len += (self.blocks.len() as u32).consensus_encode(w)?;
        for block in &self.blocks {
            len += block.header.consensus_encode(w)?;
            len += (block.txids.len() as u32).consensus_encode(w)?;
            for txid in &block.txids {
                len += txid.consensus_encode(w)?;
            }
        }
        Ok(len)
    }
}

impl Decodable for Reorg {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> WireResult<Self> {
        let block_height = u32::consensus_decode(r)?;
        let count = u32::consensus_decode(r)?;
        let mut blocks = Vec::new();
        for _ in 0..count {
            let header = BlockHeader::consensus_decode(r)?;
            let tx_count = u32::consensus_decode(r)?;
            let mut txids = Vec::new();
            for _ in 0..tx_count {
                txids.push(Hash32::consensus_decode(r)?);
            }
            blocks.push(ReorgBlock {
                header,
                txids,
            });
        }
        Ok(Reorg {
            block_height,
            blocks,
        })
    }
}

fn decode_reorg(data: &[u8]) -> StorageResult<Reorg> {
    Ok(Reorg::consensus_decode(&mut Cursor::new(data))?)
}

pub struct ReorgRepository {
    store: Arc<dyn Storage>,
}

impl ReorgRepository {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
        }
    }

    /// Saves `reorg` as the active one.
    pub async fn save(&self, reorg: &Reorg) -> StorageResult<()> {
        let mut data = Vec::new();
        reorg.consensus_encode(&mut data)?;
        self.store.write(ACTIVE_KEY, &data).await
    }

    pub async fn get_active(&self) -> StorageResult<Option<Reorg>> {
        match read_optional(self.store.as_ref(), ACTIVE_KEY).await? {
            Some(data) => decode_reorg(&data).map(Some),
            None => Ok(None),
        }
    }

    /// Archives the active reorg under its id. Fails when there is no active reorg.
    pub async fn clear_active(&self) -> StorageResult<()> {
        let data = self.store.read(ACTIVE_KEY).await?;
        let active = decode_reorg(&data)?;
        let key = format!("{}{}", REORGS_PREFIX, hex::encode(active.id()));
        self.store.write(&key, &data).await?;
        self.store.remove(ACTIVE_KEY).await
    }

    /// All reorgs, archived and active.
    pub async fn list(&self) -> StorageResult<Vec<Reorg>> {
        let mut result = Vec::new();
        for key in self.store.list(REORGS_PREFIX).await? {
            result.push(decode_reorg(&self.store.read(&key).await?)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::wire::Network;

    fn reorg(height: u32) -> Reorg {
        let mut header = Network::Regtest.genesis_header();
        header.nonce = height;
        Reorg {
            block_height: height,
            blocks: vec![
                ReorgBlock {
                    header,
                    txids: vec![Hash32::hash(b"a"), Hash32::hash(b"b")],
                },
                ReorgBlock {
                    header: BlockHeader {
                        prev_blockhash: header.block_hash(),
                        ..header
                    },
                    txids: vec![],
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_active_lifecycle() {
        let store = Arc::new(MemoryStorage::new());
        let repo = ReorgRepository::new(store.clone());
        assert_eq!(repo.get_active().await.unwrap(), None);
        assert!(repo.clear_active().await.unwrap_err().is_not_found());

        let active = reorg(100);
        repo.save(&active).await.unwrap();
        assert_eq!(repo.get_active().await.unwrap(), Some(active.clone()));
        assert_eq!(active.txids().count(), 2);

        repo.clear_active().await.unwrap();
        assert_eq!(repo.get_active().await.unwrap(), None);
        let archived = format!("spynode/reorgs/{}", hex::encode(active.id()));
        assert!(store.read(&archived).await.is_ok());

        repo.save(&reorg(200)).await.unwrap();
        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&active));
        assert!(all.contains(&reorg(200)));
    }

    #[test]
    fn test_id_depends_on_height_and_blocks() {
        let a = reorg(1);
        let mut b = a.clone();
        b.block_height = 2;
        assert_ne!(a.id(), b.id());

        let mut c = a.clone();
        c.blocks.pop();
        assert_ne!(a.id(), c.id());

        let mut d = a.clone();
        d.blocks[0].txids.clear();
        assert_eq!(a.id(), d.id());
    }
}
