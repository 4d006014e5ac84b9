//! Unit tests for header lookups and tx queries

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::client::{Config, Node};
    use crate::error::{SpyNodeError, StorageError};
    use crate::handler::{HandlerError, Tx, TxFetcher, TxState};
    use crate::storage::MemoryStorage;
    use crate::test_utils::{MockTxFetcher, next_header, tx_paying};
    use crate::wire::{BlockHeader, Network};

    async fn node_with_chain(length: u32, fetcher: Option<Arc<MockTxFetcher>>) -> (Node, Vec<BlockHeader>) {
        let config = Config::regtest("127.0.0.1:18444");
        let tx_fetcher = fetcher.map(|f| f as Arc<dyn TxFetcher>);
        let node = Node::new(config, Arc::new(MemoryStorage::new()), tx_fetcher, None).unwrap();
        node.load().await.unwrap();

        let mut headers = vec![Network::Regtest.genesis_header()];
        for height in 1..=length {
            let header = next_header(&headers[height as usize - 1], height);
            node.blocks.add(&header).await.unwrap();
            headers.push(header);
        }
        (node, headers)
    }

    #[tokio::test]
    async fn test_block_hash_lookup() {
        let (node, headers) = node_with_chain(3, None).await;
        assert_eq!(node.last_height().await, 3);
        assert_eq!(node.block_hash(-1).await.unwrap(), headers[3].block_hash());
        assert_eq!(node.block_hash(1).await.unwrap(), headers[1].block_hash());
        assert_eq!(node.hash(0).await.unwrap(), headers[0].block_hash());

        assert!(matches!(
            node.block_hash(-2).await,
            Err(SpyNodeError::Storage(StorageError::InvalidHeight(-2)))
        ));
        assert!(node.block_hash(4).await.is_err());
    }

    #[tokio::test]
    async fn test_time_beyond_tip_is_zero() {
        let (node, headers) = node_with_chain(2, None).await;
        assert_eq!(node.time(2).await.unwrap(), headers[2].time);
        assert_eq!(node.time(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_headers_from_height() {
        let (node, headers) = node_with_chain(5, None).await;

        let result = node.get_headers(2, 2).await.unwrap();
        assert_eq!(result.request_height, 2);
        assert_eq!(result.start_height, 2);
        assert_eq!(result.headers, headers[2..4].to_vec());

        let clipped = node.get_headers(4, 10).await.unwrap();
        assert_eq!(clipped.headers, headers[4..].to_vec());

        assert!(node.get_headers(9, 3).await.unwrap().headers.is_empty());
    }

    #[tokio::test]
    async fn test_get_headers_from_tip() {
        let (node, headers) = node_with_chain(5, None).await;

        let result = node.get_headers(-1, 3).await.unwrap();
        assert_eq!(result.request_height, -1);
        assert_eq!(result.start_height, 3);
        assert_eq!(result.headers, headers[3..].to_vec());

        let all = node.get_headers(-1, 100).await.unwrap();
        assert_eq!(all.start_height, 0);
        assert_eq!(all.headers.len(), 6);
    }

    #[tokio::test]
    async fn test_get_tx_prefers_stored_state() {
        let fetcher = Arc::new(MockTxFetcher::new());
        let remote = tx_paying(&[2u8; 20], 2);
        fetcher.insert(remote.clone()).await;
        let (node, _) = node_with_chain(0, Some(fetcher)).await;

        let stored = tx_paying(&[1u8; 20], 1);
        node.tx_states
            .save(&Tx {
                tx: stored.clone(),
                outputs: Vec::new(),
                state: TxState::default(),
            })
            .await
            .unwrap();

        assert_eq!(node.get_tx(stored.txid()).await.unwrap(), stored);
        assert_eq!(node.get_tx(remote.txid()).await.unwrap(), remote);
        assert!(node.get_tx(tx_paying(&[3u8; 20], 3).txid()).await.is_err());
    }

    #[tokio::test]
    async fn test_queries_need_fetchers() {
        let (node, _) = node_with_chain(0, None).await;
        let txid = tx_paying(&[1u8; 20], 1).txid();
        assert!(matches!(
            node.get_tx(txid).await,
            Err(SpyNodeError::Handler(HandlerError::Fetch(_)))
        ));
        assert!(matches!(
            node.get_outputs(&[]).await,
            Err(SpyNodeError::Handler(HandlerError::Fetch(_)))
        ));
    }

    #[tokio::test]
    async fn test_subscriptions_update_filter() {
        let (node, _) = node_with_chain(0, None).await;
        let tx = tx_paying(&[7u8; 20], 1);
        assert!(!node.is_relevant(&tx).await);

        node.subscribe_push_datas(&[vec![7u8; 20]]).await;
        assert!(node.is_relevant(&tx).await);
        node.unsubscribe_push_datas(&[vec![7u8; 20]]).await;
        assert!(!node.is_relevant(&tx).await);

        node.subscribe_headers().await;
        assert!(node.filter.read().await.headers());
        node.unsubscribe_headers().await;
        assert!(!node.filter.read().await.headers());

        node.subscribe_contracts().await;
        assert!(node.filter.read().await.contracts());
    }
}
