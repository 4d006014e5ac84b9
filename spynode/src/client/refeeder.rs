//! Replays stored blocks from a height to the tip, one block at a time.

use crate::wire::{Block, Hash32};

#[derive(Debug, Default)]
pub struct BlockRefeeder {
    next: Option<(u32, Hash32)>,
    requested: bool,
    block: Option<Block>,
}

impl BlockRefeeder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.next.is_some()
    }

    /// Height of the block being refed.
    pub fn next_height(&self) -> Option<u32> {
        self.next.map(|(height, _)| height)
    }

    /// Starts refeeding at `height`, or moves an active refeed back to it.
    pub fn set_height(&mut self, height: u32, hash: Hash32) {
        if self.next.is_none_or(|(next, _)| next > height) {
            self.next = Some((height, hash));
            self.requested = false;
            self.block = None;
        }
    }

    pub fn is_waiting_for(&self, hash: &Hash32) -> bool {
        self.block.is_none() && self.next.is_some_and(|(_, next_hash)| next_hash == *hash)
    }

    /// Accepts the block being waited for. Returns false for any other block.
    pub fn set_block(&mut self, hash: &Hash32, block: Block) -> bool {
        match self.next {
            Some((_, next_hash)) if next_hash == *hash => {
                self.block = Some(block);
                true
            }
            _ => false,
        }
    }

    /// Takes the received block with its height.
    pub fn take_block(&mut self) -> Option<(Block, u32)> {
        let (height, _) = self.next?;
        self.block.take().map(|block| (block, height))
    }

    /// The hash to request, returned once per height.
    pub fn block_to_request(&mut self) -> Option<Hash32> {
        let (_, hash) = self.next?;
        if self.requested {
            return None;
        }
        self.requested = true;
        Some(hash)
    }

    /// Forgets that the current block was requested, so it is requested again on the next
    /// connection. A received block is kept.
    pub fn reset_request(&mut self) {
        if self.next.is_some() && self.block.is_none() {
            self.requested = false;
        }
    }

    /// Moves to the next height. Ignored unless `height` directly follows the current one.
    pub fn increment(&mut self, height: u32, hash: Hash32) {
        if let Some((next, _)) = self.next {
            if next + 1 == height {
                self.next = Some((height, hash));
                self.requested = false;
                self.block = None;
            }
        }
    }

    /// Ends the refeed if it is at `height`.
    pub fn clear(&mut self, height: u32) {
        if self.next_height() == Some(height) {
            self.next = None;
            self.requested = true;
            self.block = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Network;

    fn block(nonce: u32) -> Block {
        let mut header = Network::Regtest.genesis_header();
        header.nonce = nonce;
        Block {
            header,
            txdata: vec![],
        }
    }

    #[test]
    fn test_refeed_steps() {
        let mut refeeder = BlockRefeeder::new();
        assert!(!refeeder.is_active());
        assert_eq!(refeeder.block_to_request(), None);

        let first = block(1);
        refeeder.set_height(5, first.block_hash());
        assert_eq!(refeeder.next_height(), Some(5));
        assert_eq!(refeeder.block_to_request(), Some(first.block_hash()));
        assert_eq!(refeeder.block_to_request(), None);

        assert!(!refeeder.is_waiting_for(&block(2).block_hash()));
        assert!(refeeder.is_waiting_for(&first.block_hash()));
        assert!(!refeeder.set_block(&block(2).block_hash(), block(2)));
        assert!(refeeder.take_block().is_none());
        assert!(refeeder.set_block(&first.block_hash(), first.clone()));
        assert_eq!(refeeder.take_block(), Some((first, 5)));
        assert!(refeeder.take_block().is_none());

        let second = block(2);
        refeeder.increment(7, second.block_hash());
        assert_eq!(refeeder.next_height(), Some(5));
        refeeder.increment(6, second.block_hash());
        assert_eq!(refeeder.next_height(), Some(6));
        assert_eq!(refeeder.block_to_request(), Some(second.block_hash()));

        refeeder.clear(5);
        assert!(refeeder.is_active());
        refeeder.clear(6);
        assert!(!refeeder.is_active());
    }

    #[test]
    fn test_reset_request_requests_again() {
        let mut refeeder = BlockRefeeder::new();
        refeeder.reset_request();
        assert_eq!(refeeder.block_to_request(), None);

        let first = block(1);
        refeeder.set_height(3, first.block_hash());
        assert_eq!(refeeder.block_to_request(), Some(first.block_hash()));
        refeeder.reset_request();
        assert_eq!(refeeder.block_to_request(), Some(first.block_hash()));

        refeeder.set_block(&first.block_hash(), first.clone());
        refeeder.reset_request();
        assert_eq!(refeeder.block_to_request(), None);
        assert_eq!(refeeder.take_block(), Some((first, 3)));
    }

    #[test]
    fn test_set_height_only_moves_back() {
        let mut refeeder = BlockRefeeder::new();
        refeeder.set_height(10, Hash32::hash(b"10"));
        refeeder.set_height(12, Hash32::hash(b"12"));
        assert_eq!(refeeder.next_height(), Some(10));
        refeeder.set_height(0, Hash32::hash(b"0"));
        assert_eq!(refeeder.next_height(), Some(0));
        assert_eq!(refeeder.block_to_request(), Some(Hash32::hash(b"0")));
    }
}
