//! Progress of the trusted connection: handshake flags and the block request pipeline.
//!
//! Blocks are requested in chain order. At most [`MAX_REQUESTED_BLOCKS`] requests are
//! active at once; further hashes wait in a queue until active requests are processed.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::StateError;
use crate::wire::message::PROTOCOL_VERSION;
use crate::wire::{Block, Hash32};

/// Max concurrent block requests.
pub const MAX_REQUESTED_BLOCKS: usize = 10;

/// Bytes of received but unprocessed blocks before no more are requested.
pub const MAX_PENDING_BLOCK_SIZE: usize = 100_000_000;

pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(30);
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct RequestedBlock {
    hash: Hash32,
    time: Instant,
    block: Option<Block>,
    size: usize,
}

impl RequestedBlock {
    fn new(hash: Hash32) -> Self {
        Self {
            hash,
            time: Instant::now(),
            block: None,
            size: 0,
        }
    }
}

/// State of the trusted connection.
#[derive(Debug)]
pub struct SyncState {
    /// Time of the last connection.
    pub connected_time: Option<Instant>,

    /// The peer's version message was received.
    pub version_received: bool,

    pub protocol_version: u32,

    pub handshake_complete: bool,

    pub sent_send_headers: bool,

    /// Set once the post-sync work for the current connection is done.
    pub was_in_sync: bool,

    /// All blocks the peer announced were processed.
    pub is_in_sync: bool,

    /// The in-sync notification was sent. Survives reconnects.
    pub notified_sync: bool,

    pub addresses_requested: bool,

    pub mempool_requested: bool,

    /// Time of the outstanding headers request.
    pub headers_requested: Option<Instant>,

    /// Height of the first block whose contents are processed.
    pub start_height: Option<u32>,

    /// The peer sent all its headers. Only queued blocks remain to be processed.
    pub pending_sync: bool,

    blocks_requested: VecDeque<RequestedBlock>,
    blocks_to_request: VecDeque<Hash32>,
    pending_block_size: usize,
    last_saved_hash: Hash32,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            connected_time: None,
            version_received: false,
            protocol_version: PROTOCOL_VERSION,
            handshake_complete: false,
            sent_send_headers: false,
            was_in_sync: false,
            is_in_sync: false,
            notified_sync: false,
            addresses_requested: false,
            mempool_requested: false,
            headers_requested: None,
            start_height: None,
            pending_sync: false,
            blocks_requested: VecDeque::new(),
            blocks_to_request: VecDeque::new(),
            pending_block_size: 0,
            last_saved_hash: Hash32::all_zeros(),
        }
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears everything tied to a connection.
    pub fn reset(&mut self) {
        *self = Self {
            notified_sync: self.notified_sync,
            addresses_requested: self.addresses_requested,
            start_height: self.start_height,
            last_saved_hash: self.last_saved_hash,
            ..Self::default()
        };
    }

    pub fn mark_connected(&mut self) {
        self.connected_time = Some(Instant::now());
    }

    pub fn is_ready(&self) -> bool {
        self.is_in_sync
    }

    pub fn set_in_sync(&mut self) {
        self.is_in_sync = true;
    }

    pub fn clear_in_sync(&mut self) {
        self.was_in_sync = false;
        self.is_in_sync = false;
    }

    pub fn mark_headers_requested(&mut self) {
        self.headers_requested = Some(Instant::now());
    }

    pub fn clear_headers_requested(&mut self) {
        self.headers_requested = None;
    }

    pub fn block_is_requested(&self, hash: &Hash32) -> bool {
        self.blocks_requested.iter().any(|request| request.hash == *hash)
    }

    pub fn block_is_to_be_requested(&self, hash: &Hash32) -> bool {
        self.blocks_to_request.contains(hash)
    }

    /// Adds a block to the request pipeline. `prev_hash` must be the last hash in it.
    ///
    /// Returns true when the block should be requested now, false when it was queued.
    pub fn add_block_request(&mut self, prev_hash: &Hash32, hash: Hash32) -> Result<bool, StateError> {
        if let Some(last) = self.blocks_to_request.back() {
            if last != prev_hash {
                return Err(StateError::WrongPreviousHash);
            }
            self.blocks_to_request.push_back(hash);
            return Ok(false);
        }

        let last = self
            .blocks_requested
            .back()
            .map(|request| &request.hash)
            .unwrap_or(&self.last_saved_hash);
        if last != prev_hash {
            return Err(StateError::WrongPreviousHash);
        }

        if self.blocks_requested.len() >= MAX_REQUESTED_BLOCKS
            || self.pending_block_size > MAX_PENDING_BLOCK_SIZE
        {
            self.blocks_to_request.push_back(hash);
            return Ok(false);
        }

        self.blocks_requested.push_back(RequestedBlock::new(hash));
        Ok(true)
    }

    /// Attaches a received block to its active request. False when it was not requested.
    pub fn add_block(&mut self, block: Block) -> bool {
        let hash = block.block_hash();
        let Some(request) = self.blocks_requested.iter_mut().find(|r| r.hash == hash) else {
            return false;
        };
        if let Some(previous) = request.block.take() {
            self.pending_block_size -= previous.size();
        }
        request.size = block.size();
        request.block = Some(block);
        self.pending_block_size += request.size;
        true
    }

    /// Takes the next block in chain order once it has arrived.
    pub fn next_block(&mut self) -> Option<Block> {
        if self.blocks_requested.front()?.block.is_none() {
            return None;
        }
        let request = self.blocks_requested.pop_front()?;
        self.pending_block_size -= request.size;
        self.last_saved_hash = request.hash;
        request.block
    }

    /// Moves the next queued hash to the active requests when there is room.
    ///
    /// Returns the hash with the new number of active requests.
    pub fn get_next_block_to_request(&mut self) -> Option<(Hash32, usize)> {
        if self.blocks_requested.len() >= MAX_REQUESTED_BLOCKS
            || self.pending_block_size > MAX_PENDING_BLOCK_SIZE
        {
            return None;
        }
        let hash = self.blocks_to_request.pop_front()?;
        self.blocks_requested.push_back(RequestedBlock::new(hash));
        Some((hash, self.blocks_requested.len()))
    }

    pub fn blocks_requested_count(&self) -> usize {
        self.blocks_requested.len()
    }

    pub fn blocks_to_request_count(&self) -> usize {
        self.blocks_to_request.len()
    }

    pub fn total_block_request_count(&self) -> usize {
        self.blocks_requested.len() + self.blocks_to_request.len()
    }

    pub fn block_requests_empty(&self) -> bool {
        self.blocks_requested.is_empty() && self.blocks_to_request.is_empty()
    }

    /// Hash of the last block in the pipeline, or of the last processed block.
    pub fn last_hash(&self) -> Hash32 {
        if let Some(hash) = self.blocks_to_request.back() {
            return *hash;
        }
        if let Some(request) = self.blocks_requested.back() {
            return request.hash;
        }
        self.last_saved_hash
    }

    pub fn set_last_hash(&mut self, hash: Hash32) {
        self.last_saved_hash = hash;
    }

    pub fn clear_block_requests(&mut self) {
        tracing::info!(
            "Clearing {} requested blocks and {} blocks to request",
            self.blocks_requested.len(),
            self.blocks_to_request.len()
        );
        self.blocks_requested.clear();
        self.blocks_to_request.clear();
        self.pending_block_size = 0;
    }

    /// Drops every request after `hash`. Nothing changes when `hash` is not in the pipeline.
    pub fn clear_block_requests_after(&mut self, hash: &Hash32) {
        tracing::info!(hash = %hash, "Clearing block requests after");

        if let Some(index) = self.blocks_requested.iter().position(|r| r.hash == *hash) {
            let removed: Vec<RequestedBlock> = self.blocks_requested.drain(index + 1..).collect();
            tracing::info!("Removing {} requested blocks", removed.len());
            for request in removed {
                self.pending_block_size -= request.size;
            }
            self.blocks_to_request.clear();
            return;
        }

        if let Some(index) = self.blocks_to_request.iter().position(|h| h == hash) {
            tracing::info!("Removing {} blocks to request", self.blocks_to_request.len() - index - 1);
            self.blocks_to_request.truncate(index + 1);
        }
    }

    /// The hash `delta` entries back from the end of the pipeline.
    pub fn block_request_hash(&self, delta: usize) -> Option<Hash32> {
        if self.blocks_to_request.len() > delta {
            return self.blocks_to_request.get(self.blocks_to_request.len() - delta - 1).copied();
        }
        if self.blocks_requested.len() > delta {
            return self
                .blocks_requested
                .get(self.blocks_requested.len() - delta - 1)
                .map(|request| request.hash);
        }
        None
    }

    /// Fails when a headers request or the oldest block request went unanswered too long.
    pub fn check_timeouts(&self) -> Result<(), StateError> {
        let now = Instant::now();
        if let Some(requested) = self.headers_requested {
            if now.duration_since(requested) > HEADERS_TIMEOUT {
                return Err(StateError::HeadersTimeout);
            }
        }
        if let Some(request) = self.blocks_requested.front() {
            if request.block.is_none() && now.duration_since(request.time) > BLOCK_TIMEOUT {
                return Err(StateError::BlockTimeout(request.hash));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{BlockHeader, Network, Transaction};

    /// A chain of empty blocks following `prev`.
    fn chain(prev: Hash32, count: usize) -> Vec<Block> {
        let mut result: Vec<Block> = Vec::new();
        let mut prev = prev;
        for i in 0..count {
            let coinbase = Transaction {
                version: 1,
                input: vec![],
                output: vec![],
                lock_time: i as u32,
            };
            let header = BlockHeader {
                prev_blockhash: prev,
                merkle_root: coinbase.txid(),
                nonce: i as u32,
                ..Network::Regtest.genesis_header()
            };
            let block = Block {
                header,
                txdata: vec![coinbase],
            };
            prev = block.block_hash();
            result.push(block);
        }
        result
    }

    fn genesis() -> Hash32 {
        Network::Regtest.genesis_header().block_hash()
    }

    #[test]
    fn test_request_pipeline() {
        let mut state = SyncState::new();
        state.set_last_hash(genesis());
        let blocks = chain(genesis(), 15);

        let mut prev = genesis();
        for (i, block) in blocks.iter().enumerate() {
            let hash = block.block_hash();
            assert_eq!(state.add_block_request(&prev, hash), Ok(i < MAX_REQUESTED_BLOCKS));
            prev = hash;
        }
        assert_eq!(state.blocks_requested_count(), 10);
        assert_eq!(state.blocks_to_request_count(), 5);
        assert_eq!(state.last_hash(), blocks[14].block_hash());
        assert_eq!(state.block_request_hash(0), Some(blocks[14].block_hash()));
        assert_eq!(state.block_request_hash(4), Some(blocks[10].block_hash()));
        assert_eq!(state.block_request_hash(6), Some(blocks[3].block_hash()));
        assert_eq!(state.block_request_hash(10), None);

        assert_eq!(state.add_block_request(&genesis(), Hash32::hash(b"x")), Err(StateError::WrongPreviousHash));
        assert_eq!(state.get_next_block_to_request(), None);

        // Out of order arrival waits for the first block.
        assert!(state.add_block(blocks[1].clone()));
        assert_eq!(state.next_block(), None);
        assert!(state.add_block(blocks[0].clone()));
        assert!(!state.add_block(blocks[12].clone()));
        assert_eq!(state.next_block(), Some(blocks[0].clone()));
        assert_eq!(state.next_block(), Some(blocks[1].clone()));
        assert_eq!(state.next_block(), None);

        assert_eq!(state.get_next_block_to_request(), Some((blocks[10].block_hash(), 9)));
        assert_eq!(state.get_next_block_to_request(), Some((blocks[11].block_hash(), 10)));
        assert_eq!(state.get_next_block_to_request(), None);
        assert_eq!(state.total_block_request_count(), 13);
    }

    #[test]
    fn test_clear_block_requests_after() {
        let mut state = SyncState::new();
        state.set_last_hash(genesis());
        let blocks = chain(genesis(), 12);
        let mut prev = genesis();
        for block in &blocks {
            state.add_block_request(&prev, block.block_hash()).unwrap();
            prev = block.block_hash();
        }

        state.clear_block_requests_after(&blocks[10].block_hash());
        assert_eq!(state.blocks_requested_count(), 10);
        assert_eq!(state.blocks_to_request_count(), 1);

        state.clear_block_requests_after(&Hash32::hash(b"unknown"));
        assert_eq!(state.total_block_request_count(), 11);

        state.clear_block_requests_after(&blocks[4].block_hash());
        assert_eq!(state.blocks_requested_count(), 5);
        assert_eq!(state.blocks_to_request_count(), 0);
        assert_eq!(state.last_hash(), blocks[4].block_hash());

        state.clear_block_requests();
        assert!(state.block_requests_empty());
        assert_eq!(state.last_hash(), genesis());
    }

    #[test]
    fn test_reset_keeps_notified_sync() {
        let mut state = SyncState::new();
        state.set_last_hash(genesis());
        state.mark_connected();
        state.version_received = true;
        state.handshake_complete = true;
        state.notified_sync = true;
        state.set_in_sync();
        state.start_height = Some(7);
        state.add_block_request(&genesis(), Hash32::hash(b"next")).unwrap();

        state.reset();
        assert!(state.notified_sync);
        assert!(!state.handshake_complete);
        assert!(!state.is_ready());
        assert!(state.connected_time.is_none());
        assert_eq!(state.start_height, Some(7));
        assert!(state.block_requests_empty());
        assert_eq!(state.last_hash(), genesis());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_timeouts() {
        let mut state = SyncState::new();
        state.set_last_hash(genesis());
        assert_eq!(state.check_timeouts(), Ok(()));

        state.mark_headers_requested();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(state.check_timeouts(), Err(StateError::HeadersTimeout));
        state.clear_headers_requested();

        let blocks = chain(genesis(), 1);
        let hash = blocks[0].block_hash();
        state.add_block_request(&genesis(), hash).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(state.check_timeouts(), Ok(()));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(state.check_timeouts(), Err(StateError::BlockTimeout(hash)));

        // Received blocks waiting to be processed do not time out.
        state.add_block(blocks[0].clone());
        assert_eq!(state.check_timeouts(), Ok(()));
    }
}
