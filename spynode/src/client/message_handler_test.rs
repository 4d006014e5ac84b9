//! Unit tests for trusted node message handling and header sync

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::client::{Config, Node};
    use crate::network::outgoing::build_version_msg;
    use crate::storage::MemoryStorage;
    use crate::test_utils::{RecordingHandler, block_on, next_header, tx_paying};
    use crate::wire::message::{Address, PROTOCOL_VERSION, SERVICE_NODE_NETWORK, TimedAddress};
    use crate::wire::{BlockHeader, Inventory, Network, NetworkMessage};

    async fn setup(config: Config) -> (Arc<Node>, Arc<RecordingHandler>) {
        let node = Arc::new(Node::new(config, Arc::new(MemoryStorage::new()), None, None).unwrap());
        let handler = Arc::new(RecordingHandler::new());
        node.register_handler(handler.clone()).await;
        node.load().await.unwrap();
        (node, handler)
    }

    fn regtest() -> Config {
        Config::regtest("127.0.0.1:18444").with_untrusted_count(0)
    }

    fn headers_after(prev: &BlockHeader, count: u32, nonce: u32) -> Vec<BlockHeader> {
        let mut headers: Vec<BlockHeader> = Vec::new();
        for i in 0..count {
            let prev = headers.last().unwrap_or(prev);
            headers.push(next_header(prev, nonce + i));
        }
        headers
    }

    fn block_requests(messages: &[NetworkMessage]) -> Vec<Inventory> {
        messages
            .iter()
            .flat_map(|message| match message {
                NetworkMessage::GetData(items) => items.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (node, _) = setup(regtest()).await;
        let responses = node.handle_message(NetworkMessage::Ping(7)).await.unwrap();
        assert_eq!(responses, vec![NetworkMessage::Pong(7)]);
    }

    #[tokio::test]
    async fn test_version_answered_with_verack() {
        let (node, _) = setup(regtest()).await;
        let responses = node.handle_message(build_version_msg("/peer/", 100)).await.unwrap();
        assert_eq!(responses, vec![NetworkMessage::Verack]);

        let state = node.state.lock().await;
        assert!(state.version_received);
        assert_eq!(state.protocol_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_addresses_added_to_peers() {
        let (node, _) = setup(regtest()).await;
        let socket = "10.0.0.1:8333".parse().unwrap();
        let entry = TimedAddress {
            time: 0,
            address: Address::new(&socket, SERVICE_NODE_NETWORK),
        };
        node.handle_message(NetworkMessage::Addr(vec![entry, entry])).await.unwrap();
        assert_eq!(node.peers.count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_headers_set_in_sync() {
        let (node, _) = setup(regtest()).await;
        node.handle_message(NetworkMessage::Headers(Vec::new())).await.unwrap();

        let state = node.state.lock().await;
        assert!(state.pending_sync);
        assert!(state.is_ready());
        assert!(state.headers_requested.is_none());
    }

    #[tokio::test]
    async fn test_new_headers_request_blocks() {
        let (node, _) = setup(regtest()).await;
        let genesis = Network::Regtest.genesis_header();
        let headers = headers_after(&genesis, 3, 1);

        let messages = node.handle_message(NetworkMessage::Headers(headers.clone())).await.unwrap();
        let expected: Vec<Inventory> =
            headers.iter().map(|header| Inventory::Block(header.block_hash())).collect();
        assert_eq!(block_requests(&messages), expected);

        let state = node.state.lock().await;
        assert_eq!(state.last_hash(), headers[2].block_hash());
        assert_eq!(state.total_block_request_count(), 3);
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_repeated_headers_not_requested_again() {
        let (node, _) = setup(regtest()).await;
        let headers = headers_after(&Network::Regtest.genesis_header(), 2, 1);

        node.handle_message(NetworkMessage::Headers(headers.clone())).await.unwrap();
        let messages = node.handle_message(NetworkMessage::Headers(headers)).await.unwrap();
        assert!(block_requests(&messages).is_empty());
        assert_eq!(node.state.lock().await.total_block_request_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_header_stops_processing() {
        let (node, _) = setup(regtest()).await;
        let genesis = Network::Regtest.genesis_header();
        let mut headers = headers_after(&genesis, 1, 1);
        let orphan_parent = next_header(&genesis, 99);
        let orphan = next_header(&orphan_parent, 100);
        headers.push(orphan);
        headers.push(next_header(&orphan, 101));

        let messages = node.handle_message(NetworkMessage::Headers(headers.clone())).await.unwrap();
        assert_eq!(block_requests(&messages), vec![Inventory::Block(headers[0].block_hash())]);
    }

    #[tokio::test]
    async fn test_headers_before_start_block_are_only_recorded() {
        let genesis = Network::Regtest.genesis_header();
        let headers = headers_after(&genesis, 4, 1);
        let config = regtest().with_start_hash(headers[2].block_hash());
        let (node, _) = setup(config).await;

        let messages = node.handle_message(NetworkMessage::Headers(headers.clone())).await.unwrap();
        assert_eq!(
            block_requests(&messages),
            vec![Inventory::Block(headers[2].block_hash()), Inventory::Block(headers[3].block_hash())]
        );
        assert_eq!(node.blocks.last_height().await, 2);
        assert_eq!(node.state.lock().await.start_height, Some(3));
    }

    #[tokio::test]
    async fn test_reorg_in_pending_blocks_replaces_requests() {
        let (node, _) = setup(regtest()).await;
        let genesis = Network::Regtest.genesis_header();
        let headers = headers_after(&genesis, 3, 1);
        node.handle_message(NetworkMessage::Headers(headers.clone())).await.unwrap();

        let branch = next_header(&headers[0], 50);
        let messages = node.handle_message(NetworkMessage::Headers(vec![branch])).await.unwrap();
        assert_eq!(block_requests(&messages), vec![Inventory::Block(branch.block_hash())]);

        let state = node.state.lock().await;
        assert_eq!(state.last_hash(), branch.block_hash());
        assert_eq!(state.total_block_request_count(), 2);
    }

    #[tokio::test]
    async fn test_reorg_of_processed_blocks_reverts_them() {
        let (node, _) = setup(regtest()).await;
        let genesis = Network::Regtest.genesis_header();
        let headers = headers_after(&genesis, 3, 1);
        for header in &headers {
            node.blocks.add(header).await.unwrap();
        }
        node.state.lock().await.set_last_hash(headers[2].block_hash());

        let reverted = tx_paying(&[1; 20], 1).txid();
        node.txs.add(reverted, true, true, Some(3)).await.unwrap();

        let branch = next_header(&headers[0], 50);
        let messages = node.handle_message(NetworkMessage::Headers(vec![branch])).await.unwrap();
        assert_eq!(block_requests(&messages), vec![Inventory::Block(branch.block_hash())]);

        assert_eq!(node.blocks.last_height().await, 1);
        assert_eq!(node.blocks.last_hash().await, headers[0].block_hash());
        assert!(node.txs.contains(&reverted, None).await.unwrap());
        assert!(!node.txs.contains(&reverted, Some(3)).await.unwrap());
        assert_eq!(node.events.reverted_count().await, 1);

        let reorg = node.reorgs.get_active().await.unwrap().unwrap();
        assert_eq!(reorg.block_height, 1);
        assert_eq!(reorg.blocks.len(), 2);
        assert_eq!(reorg.blocks[0].header, headers[1]);
        assert_eq!(reorg.blocks[1].txids, vec![reverted]);
    }

    #[tokio::test]
    async fn test_inventory_ignored_until_ready() {
        let (node, _) = setup(regtest()).await;
        let txid = tx_paying(&[1; 20], 1).txid();
        let inv = NetworkMessage::Inv(vec![Inventory::Transaction(txid)]);

        assert!(node.handle_message(inv.clone()).await.unwrap().is_empty());

        node.state.lock().await.set_in_sync();
        let messages = node.handle_message(inv.clone()).await.unwrap();
        assert_eq!(messages, vec![NetworkMessage::GetData(vec![Inventory::Transaction(txid)])]);

        // A repeated announcement waits in the tracker instead.
        assert!(node.handle_message(inv).await.unwrap().is_empty());
        assert_eq!(node.tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_trusted_tx_queued_when_ready() {
        let (node, _) = setup(regtest()).await;
        let mut receiver = node.unconfirmed.open(10, CancellationToken::new()).await;
        let tx = tx_paying(&[1; 20], 1);

        node.handle_message(NetworkMessage::Tx(tx.clone())).await.unwrap();
        assert!(receiver.try_recv().is_err());

        node.state.lock().await.set_in_sync();
        node.handle_message(NetworkMessage::Tx(tx.clone())).await.unwrap();
        let queued = receiver.try_recv().unwrap();
        assert_eq!(queued.tx, tx);
        assert!(queued.trusted);
        assert!(!queued.safe);
    }

    #[tokio::test]
    async fn test_requested_block_attached() {
        let (node, _) = setup(regtest()).await;
        let genesis = Network::Regtest.genesis_header();
        let block = block_on(&genesis, 1, Vec::new());
        node.handle_message(NetworkMessage::Headers(vec![block.header])).await.unwrap();

        node.handle_message(NetworkMessage::Block(block.clone())).await.unwrap();
        let next = node.state.lock().await.next_block();
        assert_eq!(next.map(|b| b.block_hash()), Some(block.block_hash()));
    }

    #[tokio::test]
    async fn test_not_found_clears_tracker() {
        let (node, _) = setup(regtest()).await;
        let txid = tx_paying(&[1; 20], 1).txid();
        node.tracker.add(txid).await;

        node.handle_message(NetworkMessage::NotFound(vec![Inventory::Transaction(txid)]))
            .await
            .unwrap();
        assert!(node.tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_check_drives_handshake_and_sync() {
        let (node, handler) = setup(regtest()).await;
        assert!(node.check().await.unwrap().is_empty());

        node.state.lock().await.version_received = true;
        let messages = node.check().await.unwrap();
        assert!(matches!(messages.as_slice(), [NetworkMessage::GetHeaders(_)]));

        node.state.lock().await.set_in_sync();
        let messages = node.check().await.unwrap();
        assert_eq!(
            messages,
            vec![NetworkMessage::SendHeaders, NetworkMessage::GetAddr, NetworkMessage::MemPool]
        );
        assert_eq!(handler.in_sync_count().await, 0);

        assert!(node.check().await.unwrap().is_empty());
        assert_eq!(handler.in_sync_count().await, 1);

        node.check().await.unwrap();
        assert_eq!(handler.in_sync_count().await, 1);
    }

    #[tokio::test]
    async fn test_in_sync_sent_once_across_reconnects() {
        let (node, handler) = setup(regtest().with_request_mempool(false)).await;
        {
            let mut state = node.state.lock().await;
            state.version_received = true;
            state.set_in_sync();
        }
        node.check().await.unwrap();
        assert_eq!(handler.in_sync_count().await, 1);

        {
            let mut state = node.state.lock().await;
            state.reset();
            state.version_received = true;
            state.set_in_sync();
        }
        let messages = node.check().await.unwrap();
        assert!(messages.contains(&NetworkMessage::SendHeaders));
        assert!(!messages.contains(&NetworkMessage::GetAddr));
        assert_eq!(handler.in_sync_count().await, 1);
    }
}
