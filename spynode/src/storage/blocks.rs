//! Block header chain, stored 1000 headers per key.
//!
//! The headers of the last (possibly partial) key are cached together with a hash to height
//! lookup of the whole chain. Older keys are read back from storage on demand.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{Storage, read_optional, remove_if_exists};
use crate::error::{StorageError, StorageResult};
use crate::wire::block::HEADER_SIZE;
use crate::wire::{BlockHeader, Hash32, Network, deserialize, serialize};

const BLOCKS_PER_KEY: u32 = 1000;

fn block_key(height: u32) -> String {
    format!("spynode/blocks/{:08x}", height / BLOCKS_PER_KEY)
}

fn decode_headers(key: &str, data: &[u8]) -> StorageResult<Vec<BlockHeader>> {
    if data.len() % HEADER_SIZE != 0 {
        return Err(StorageError::Corruption(format!(
            "Block file {} has invalid size {}",
            key,
            data.len()
        )));
    }
    data.chunks(HEADER_SIZE).map(|chunk| Ok(deserialize(chunk)?)).collect()
}

fn encode_headers(headers: &[BlockHeader]) -> Vec<u8> {
    let mut data = Vec::with_capacity(headers.len() * HEADER_SIZE);
    for header in headers {
        data.extend(serialize(header));
    }
    data
}

struct Chain {
    /// Height of the tip.
    height: u32,
    /// Headers of the key holding the tip.
    last_headers: Vec<BlockHeader>,
    heights: HashMap<Hash32, u32>,
}

impl Chain {
    fn with_genesis(genesis: BlockHeader) -> Self {
        let mut heights = HashMap::new();
        heights.insert(genesis.block_hash(), 0);
        Self {
            height: 0,
            last_headers: vec![genesis],
            heights,
        }
    }

    fn cached(&self, height: u32) -> Option<&BlockHeader> {
        if height > self.height {
            return None;
        }
        let back = (self.height - height) as usize;
        if back < self.last_headers.len() {
            Some(&self.last_headers[self.last_headers.len() - 1 - back])
        } else {
            None
        }
    }

    fn tip(&self) -> &BlockHeader {
        // The cache always holds at least the tip.
        &self.last_headers[self.last_headers.len() - 1]
    }
}

pub struct BlockRepository {
    network: Network,
    store: Arc<dyn Storage>,
    chain: Mutex<Chain>,
}

impl BlockRepository {
    pub fn new(store: Arc<dyn Storage>, network: Network) -> Self {
        Self {
            network,
            store,
            chain: Mutex::new(Chain::with_genesis(network.genesis_header())),
        }
    }

    /// Resets to a chain holding only a placeholder genesis with the given time.
    pub async fn initialize(&self, genesis_time: u32) {
        let genesis = BlockHeader {
            version: 0,
            prev_blockhash: Hash32::all_zeros(),
            merkle_root: Hash32::all_zeros(),
            time: genesis_time,
            bits: 0,
            nonce: 0,
        };
        *self.chain.lock().await = Chain::with_genesis(genesis);
    }

    /// Loads the chain from storage. An empty store starts at the network's genesis block.
    pub async fn load(&self) -> StorageResult<()> {
        let mut chain = self.chain.lock().await;

        let mut loaded: Option<Chain> = None;
        let mut index = 0u32;
        loop {
            let key = block_key(index * BLOCKS_PER_KEY);
            let Some(data) = read_optional(self.store.as_ref(), &key).await? else {
                break;
            };
            let headers = decode_headers(&key, &data)?;
            if headers.is_empty() {
                break;
            }

            let start = index * BLOCKS_PER_KEY;
            let state = loaded.get_or_insert_with(|| Chain {
                height: 0,
                last_headers: Vec::new(),
                heights: HashMap::new(),
            });
            if index > 0 && state.last_headers.len() != BLOCKS_PER_KEY as usize {
                return Err(StorageError::Corruption(format!(
                    "Block file {} is not full (count {})",
                    block_key(start - 1),
                    state.last_headers.len()
                )));
            }
            for (i, header) in headers.iter().enumerate() {
                state.heights.insert(header.block_hash(), start + i as u32);
            }
            state.height = start + headers.len() as u32 - 1;
            state.last_headers = headers;
            index += 1;
        }

        *chain = match loaded {
            Some(loaded) => {
                tracing::info!("Loaded {} block headers", loaded.height + 1);
                loaded
            }
            None => {
                let genesis = self.network.genesis_header();
                tracing::info!(hash = %genesis.block_hash(), "Adding {} genesis block", self.network);
                Chain::with_genesis(genesis)
            }
        };
        Ok(())
    }

    /// Appends a header to the tip. A full cached key is written out first.
    pub async fn add(&self, header: &BlockHeader) -> StorageResult<()> {
        let mut chain = self.chain.lock().await;
        if chain.last_headers.len() == BLOCKS_PER_KEY as usize {
            self.write(&chain).await?;
            chain.last_headers.clear();
        }
        chain.last_headers.push(*header);
        chain.height += 1;
        let height = chain.height;
        chain.heights.insert(header.block_hash(), height);
        Ok(())
    }

    pub async fn last_height(&self) -> u32 {
        self.chain.lock().await.height
    }

    pub async fn last_hash(&self) -> Hash32 {
        self.chain.lock().await.tip().block_hash()
    }

    pub async fn last_header(&self) -> BlockHeader {
        *self.chain.lock().await.tip()
    }

    pub async fn contains(&self, hash: &Hash32) -> bool {
        self.chain.lock().await.heights.contains_key(hash)
    }

    pub async fn height(&self, hash: &Hash32) -> Option<u32> {
        self.chain.lock().await.heights.get(hash).copied()
    }

    pub async fn hash(&self, height: u32) -> StorageResult<Hash32> {
        Ok(self.header(height).await?.block_hash())
    }

    /// Header at `height`. Heights beyond the tip are `StorageError::InvalidHeight`.
    pub async fn header(&self, height: u32) -> StorageResult<BlockHeader> {
        let chain = self.chain.lock().await;
        self.header_locked(&chain, height).await
    }

    /// Block time at `height`, zero when beyond the tip.
    pub async fn time(&self, height: u32) -> StorageResult<u32> {
        match self.header(height).await {
            Ok(header) => Ok(header.time),
            Err(StorageError::InvalidHeight(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Drops every header above `height` and writes the truncated tip key.
    pub async fn revert(&self, height: u32) -> StorageResult<()> {
        let mut chain = self.chain.lock().await;
        if height > chain.height {
            return Err(StorageError::InvalidHeight(height as i64));
        }

        let keep_index = height / BLOCKS_PER_KEY;
        let tip_index = chain.height / BLOCKS_PER_KEY;
        let keep = (height % BLOCKS_PER_KEY) as usize + 1;

        let mut headers = if keep_index == tip_index {
            std::mem::take(&mut chain.last_headers)
        } else {
            let key = block_key(height);
            let data = self.store.read(&key).await?;
            decode_headers(&key, &data)?
        };
        if headers.len() < keep {
            return Err(StorageError::InconsistentState(format!(
                "Block file {} holds {} headers, revert needs {}",
                block_key(height),
                headers.len(),
                keep
            )));
        }
        headers.truncate(keep);

        for index in keep_index + 1..=tip_index {
            remove_if_exists(self.store.as_ref(), &block_key(index * BLOCKS_PER_KEY)).await?;
        }

        chain.heights.retain(|_, h| *h <= height);
        chain.height = height;
        chain.last_headers = headers;
        self.write(&chain).await?;

        tracing::info!(height, hash = %chain.tip().block_hash(), "Reverted block headers");
        Ok(())
    }

    /// Writes the key holding the tip.
    pub async fn save(&self) -> StorageResult<()> {
        let chain = self.chain.lock().await;
        self.write(&chain).await
    }

    async fn write(&self, chain: &Chain) -> StorageResult<()> {
        self.store.write(&block_key(chain.height), &encode_headers(&chain.last_headers)).await
    }

    async fn header_locked(&self, chain: &Chain, height: u32) -> StorageResult<BlockHeader> {
        if height > chain.height {
            return Err(StorageError::InvalidHeight(height as i64));
        }
        if let Some(header) = chain.cached(height) {
            return Ok(*header);
        }

        let key = block_key(height);
        let data = self.store.read(&key).await?;
        let headers = decode_headers(&key, &data)?;
        if headers.len() != BLOCKS_PER_KEY as usize {
            return Err(StorageError::Corruption(format!(
                "Block file {} is not full (count {})",
                key,
                headers.len()
            )));
        }
        Ok(headers[(height % BLOCKS_PER_KEY) as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn next_header(prev: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: prev.block_hash(),
            merkle_root: Hash32::hash(&nonce.to_le_bytes()),
            time: prev.time + 600,
            bits: 0x207fffff,
            nonce,
        }
    }

    async fn build(repo: &BlockRepository, count: u32, seed: u32) -> Vec<BlockHeader> {
        let mut headers = vec![repo.last_header().await];
        for i in 0..count {
            let header = next_header(headers.last().unwrap(), seed + i);
            repo.add(&header).await.unwrap();
            headers.push(header);
        }
        headers
    }

    fn repo() -> (Arc<MemoryStorage>, BlockRepository) {
        let store = Arc::new(MemoryStorage::new());
        (store.clone(), BlockRepository::new(store, Network::Regtest))
    }

    #[tokio::test]
    async fn test_load_empty_adds_genesis() {
        let (_, blocks) = repo();
        blocks.load().await.unwrap();
        assert_eq!(blocks.last_height().await, 0);
        let genesis = Network::Regtest.genesis_header().block_hash();
        assert_eq!(blocks.last_hash().await, genesis);
        assert_eq!(blocks.height(&genesis).await, Some(0));
        assert!(matches!(blocks.header(1).await, Err(StorageError::InvalidHeight(1))));
        assert_eq!(blocks.time(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_across_keys_and_reload() {
        let (store, blocks) = repo();
        blocks.load().await.unwrap();
        let headers = build(&blocks, 2_500, 1).await;
        blocks.save().await.unwrap();

        assert_eq!(blocks.last_height().await, 2_500);
        assert_eq!(
            store.list("spynode/blocks/").await.unwrap(),
            vec!["spynode/blocks/00000000", "spynode/blocks/00000001", "spynode/blocks/00000002"]
        );

        let reloaded = BlockRepository::new(store, Network::Regtest);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.last_height().await, 2_500);
        assert_eq!(reloaded.last_hash().await, headers[2_500].block_hash());
        for height in [0u32, 1, 999, 1_000, 1_999, 2_000, 2_500] {
            assert_eq!(reloaded.hash(height).await.unwrap(), headers[height as usize].block_hash());
            assert_eq!(
                reloaded.height(&headers[height as usize].block_hash()).await,
                Some(height)
            );
        }
        assert_eq!(reloaded.time(1_500).await.unwrap(), headers[1_500].time);
    }

    #[tokio::test]
    async fn test_revert_into_earlier_key() {
        let (store, blocks) = repo();
        blocks.load().await.unwrap();
        let headers = build(&blocks, 2_100, 1).await;
        blocks.save().await.unwrap();

        blocks.revert(1_500).await.unwrap();
        assert_eq!(blocks.last_height().await, 1_500);
        assert_eq!(blocks.last_hash().await, headers[1_500].block_hash());
        assert!(!blocks.contains(&headers[1_501].block_hash()).await);
        assert!(!blocks.contains(&headers[2_100].block_hash()).await);
        assert!(store.read("spynode/blocks/00000002").await.unwrap_err().is_not_found());

        // A different branch extends the reverted tip.
        let branch = build(&blocks, 3, 90_000).await;
        assert_eq!(blocks.last_height().await, 1_503);
        blocks.save().await.unwrap();

        let reloaded = BlockRepository::new(store, Network::Regtest);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.last_hash().await, branch[3].block_hash());
        assert_eq!(reloaded.hash(999).await.unwrap(), headers[999].block_hash());
    }

    #[tokio::test]
    async fn test_revert_within_cache() {
        let (_, blocks) = repo();
        blocks.load().await.unwrap();
        let headers = build(&blocks, 10, 1).await;

        blocks.revert(7).await.unwrap();
        assert_eq!(blocks.last_height().await, 7);
        assert_eq!(blocks.last_hash().await, headers[7].block_hash());
        assert!(blocks.revert(8).await.is_err());
    }

    #[tokio::test]
    async fn test_initialize() {
        let (_, blocks) = repo();
        blocks.initialize(1_600_000_000).await;
        assert_eq!(blocks.last_height().await, 0);
        assert_eq!(blocks.time(0).await.unwrap(), 1_600_000_000);
    }
}
