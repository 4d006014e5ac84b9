//! Builders for the messages the node initiates.

use std::net::SocketAddr;

use crate::error::StorageResult;
use crate::network::constants::{VERSION_RECEIVER, VERSION_SENDER};
use crate::storage::BlockRepository;
use crate::wire::message::{Address, PROTOCOL_VERSION, SERVICE_NODE_NETWORK};
use crate::wire::{GetHeadersMessage, Hash32, NetworkMessage, VersionMessage};

/// Builds the `version` message sent right after connecting. The addresses are
/// placeholders since the node never accepts inbound connections.
pub fn build_version_msg(user_agent: &str, start_height: u32) -> NetworkMessage {
    let receiver: SocketAddr = VERSION_RECEIVER.parse().unwrap_or_else(|_| unspecified());
    let sender: SocketAddr = VERSION_SENDER.parse().unwrap_or_else(|_| unspecified());

    NetworkMessage::Version(VersionMessage {
        version: PROTOCOL_VERSION,
        services: SERVICE_NODE_NETWORK,
        timestamp: chrono::Utc::now().timestamp(),
        receiver: Address::new(&receiver, 0),
        sender: Address::new(&sender, 0),
        nonce: rand::random(),
        user_agent: user_agent.to_string(),
        start_height: start_height.min(i32::MAX as u32) as i32,
        relay: true,
    })
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

/// Builds a `getheaders` request.
///
/// The locator starts with `state_hash` (the newest block already requested, if any),
/// followed by the hashes `delta`, `2 * delta`, `4 * delta`, ... below the tip. It stops
/// after more than `max` hashes or once it reaches the bottom of the chain.
pub async fn build_header_request(
    protocol_version: u32,
    blocks: &BlockRepository,
    state_hash: Option<Hash32>,
    delta: u32,
    max: usize,
) -> StorageResult<NetworkMessage> {
    let mut locator = Vec::new();
    if let Some(hash) = state_hash {
        locator.push(hash);
    }

    let last_height = blocks.last_height().await;
    let mut delta = delta;
    while delta <= last_height {
        locator.push(blocks.hash(last_height - delta).await?);
        if locator.len() > max || last_height <= delta {
            break;
        }
        delta = (delta * 2).max(1);
    }

    Ok(NetworkMessage::GetHeaders(GetHeadersMessage {
        version: protocol_version,
        locator_hashes: locator,
        stop_hash: Hash32::all_zeros(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::chain_of;

    fn locator(message: NetworkMessage) -> Vec<Hash32> {
        match message {
            NetworkMessage::GetHeaders(request) => request.locator_hashes,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_version_message() {
        let message = build_version_msg("/test:1.0/", 1234);
        let NetworkMessage::Version(version) = message else {
            panic!("not a version message");
        };
        assert_eq!(version.user_agent, "/test:1.0/");
        assert_eq!(version.start_height, 1234);
        assert_eq!(version.services, SERVICE_NODE_NETWORK);
        assert_eq!(version.version, PROTOCOL_VERSION);
        assert_eq!(version.receiver.socket_addr().port(), 8333);
        assert_eq!(version.sender.socket_addr().port(), 9333);
        assert!(version.relay);
    }

    #[tokio::test]
    async fn test_trusted_locator_doubles_back_from_tip() {
        let (blocks, headers) = chain_of(100).await;
        let hashes = locator(build_header_request(70015, &blocks, None, 1, 50).await.unwrap());
        let expected: Vec<Hash32> =
            [99, 98, 96, 92, 84, 68, 36].iter().map(|h: &usize| headers[*h].block_hash()).collect();
        assert_eq!(hashes, expected);
    }

    #[tokio::test]
    async fn test_zero_delta_starts_at_tip() {
        let (blocks, headers) = chain_of(10).await;
        let hashes = locator(build_header_request(70015, &blocks, None, 0, 50).await.unwrap());
        let expected: Vec<Hash32> =
            [10, 9, 8, 6, 2].iter().map(|h: &usize| headers[*h].block_hash()).collect();
        assert_eq!(hashes, expected);
    }

    #[tokio::test]
    async fn test_untrusted_locator_is_bounded() {
        let (blocks, headers) = chain_of(1_000).await;
        let state_hash = Hash32::hash(b"requested");
        let hashes = locator(
            build_header_request(70015, &blocks, Some(state_hash), 6, 2).await.unwrap(),
        );
        assert_eq!(
            hashes,
            vec![state_hash, headers[994].block_hash(), headers[988].block_hash()]
        );
    }

    #[tokio::test]
    async fn test_short_chain() {
        let (blocks, _) = chain_of(3).await;
        let hashes = locator(build_header_request(70015, &blocks, None, 6, 10).await.unwrap());
        assert!(hashes.is_empty());
    }
}
