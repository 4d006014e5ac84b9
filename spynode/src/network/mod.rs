//! Peer connections: framing, outgoing message builders and untrusted peers.

pub mod channel;
pub mod connection;
pub mod constants;
pub mod outgoing;
pub mod untrusted_node;

pub use channel::MessageChannel;
pub use connection::{MessageReader, MessageWriter, connect};
pub use untrusted_node::{UntrustedContext, UntrustedNode};

use crate::wire::message::MAX_INV_PER_MSG;
use crate::wire::{Inventory, NetworkMessage, Transaction};

/// A transaction received from a peer or injected locally, queued for the unconfirmed
/// transaction processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxMessage {
    pub tx: Transaction,
    /// Received from the trusted node or injected locally.
    pub trusted: bool,
    /// Skip the safety delay.
    pub safe: bool,
}

/// Splits inventory into `getdata` messages of at most [`MAX_INV_PER_MSG`] entries.
pub fn inventory_requests(items: Vec<Inventory>) -> Vec<NetworkMessage> {
    items.chunks(MAX_INV_PER_MSG).map(|chunk| NetworkMessage::GetData(chunk.to_vec())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Hash32;

    #[test]
    fn test_inventory_requests_are_chunked() {
        assert!(inventory_requests(Vec::new()).is_empty());

        let items: Vec<Inventory> = (0..MAX_INV_PER_MSG as u32 + 1)
            .map(|i| Inventory::Block(Hash32::hash(&i.to_le_bytes())))
            .collect();
        let messages = inventory_requests(items);
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            NetworkMessage::GetData(chunk) => assert_eq!(chunk.len(), 1),
            other => panic!("unexpected message {:?}", other),
        }
    }
}
