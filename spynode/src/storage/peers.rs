//! Scored peer address book used to pick untrusted peers.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{Storage, read_optional, remove_if_exists};
use crate::error::{StorageResult, WireResult};
use crate::wire::encode::{Decodable, Encodable, read_exact_bytes, serialize};

const PEERS_KEY: &str = "spynode/peers";
const PEERS_VERSION: i32 = 2;
/// Unchecked peers are retried after this many seconds.
const RECHECK_SECONDS: u32 = 86_400;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub address: String,
    pub score: i32,
    /// Unix seconds of the last score change or use.
    pub last_time: u32,
}

impl Encodable for Peer {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = (self.address.len() as i32).consensus_encode(w)?;
        w.write_all(self.address.as_bytes())?;
        len += self.address.len();
        len += self.score.consensus_encode(w)?;
        len += self.last_time.consensus_encode(w)?;
        Ok(len)
    }
}

impl Peer {
    fn decode<R: Read + ?Sized>(r: &mut R, version: i32) -> WireResult<Self> {
        let size = i32::consensus_decode(r)?.max(0) as u64;
        let address = String::from_utf8_lossy(&read_exact_bytes(r, size)?).into_owned();
        let score = i32::consensus_decode(r)?;
        let last_time = if version > 1 {
            u32::consensus_decode(r)?
        } else {
            0
        };
        Ok(Peer {
            address,
            score,
            last_time,
        })
    }
}

fn now_seconds() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

#[derive(Default)]
struct Peers {
    list: Vec<Peer>,
    lookup: HashMap<String, usize>,
}

impl Peers {
    fn insert(&mut self, peer: Peer) {
        self.lookup.insert(peer.address.clone(), self.list.len());
        self.list.push(peer);
    }

    fn get_mut(&mut self, address: &str) -> Option<&mut Peer> {
        let index = *self.lookup.get(address)?;
        self.list.get_mut(index)
    }
}

pub struct PeerRepository {
    store: Arc<dyn Storage>,
    peers: Mutex<Peers>,
}

impl PeerRepository {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            peers: Mutex::new(Peers::default()),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        let mut peers = self.peers.lock().await;
        *peers = Peers::default();

        let Some(data) = read_optional(self.store.as_ref(), PEERS_KEY).await? else {
            return Ok(());
        };

        let mut cursor = Cursor::new(data.as_slice());
        let version = i32::consensus_decode(&mut cursor)?;
        let _count = i32::consensus_decode(&mut cursor)?;
        // A truncated trailing entry ends the list.
        while let Ok(peer) = Peer::decode(&mut cursor, version) {
            peers.insert(peer);
        }

        tracing::debug!("Loaded {} peers", peers.list.len());
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let peers = self.peers.lock().await;
        let mut data = serialize(&PEERS_VERSION);
        data.extend(serialize(&(peers.list.len() as i32)));
        for peer in &peers.list {
            data.extend(serialize(peer));
        }
        tracing::debug!("Saving {} peers", peers.list.len());
        self.store.write(PEERS_KEY, &data).await
    }

    pub async fn count(&self) -> usize {
        self.peers.lock().await.list.len()
    }

    /// Adds an address with a zero score. Returns false when it is already known.
    pub async fn add(&self, address: &str) -> bool {
        let mut peers = self.peers.lock().await;
        if peers.lookup.contains_key(address) {
            return false;
        }
        peers.insert(Peer {
            address: address.to_string(),
            score: 0,
            last_time: 0,
        });
        true
    }

    /// Peers at or above `min_score`.
    pub async fn get(&self, min_score: i32) -> Vec<Peer> {
        self.peers.lock().await.list.iter().filter(|p| p.score >= min_score).cloned().collect()
    }

    /// Peers that were never scored and not tried in the last day.
    pub async fn get_unchecked(&self) -> Vec<Peer> {
        let cutoff = now_seconds().saturating_sub(RECHECK_SECONDS);
        self.peers
            .lock()
            .await
            .list
            .iter()
            .filter(|p| p.score == 0 && p.last_time < cutoff)
            .cloned()
            .collect()
    }

    /// Adjusts a peer's score and refreshes its time. Returns false for an unknown address.
    pub async fn update_score(&self, address: &str, delta: i32) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(address) {
            Some(peer) => {
                peer.score = peer.score.saturating_add(delta);
                peer.last_time = now_seconds();
                true
            }
            None => false,
        }
    }

    pub async fn update_time(&self, address: &str) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(address) {
            Some(peer) => {
                peer.last_time = now_seconds();
                true
            }
            None => false,
        }
    }

    pub async fn clear(&self) -> StorageResult<()> {
        *self.peers.lock().await = Peers::default();
        remove_if_exists(self.store.as_ref(), PEERS_KEY).await
    }
}
