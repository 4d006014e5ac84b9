//! Relevant transaction ids: the unconfirmed set and one list per block height.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio::time::Instant;

use super::{Storage, read_optional, remove_if_exists};
use crate::error::{StorageError, StorageResult, WireError};
use crate::state::MemPool;
use crate::wire::{Decodable, Encodable, Hash32};

const UNCONFIRMED_KEY: &str = "spynode/txs/unconfirmed";
const UNCONFIRMED_VERSION: u8 = 0;
const TRUE_BYTE: u8 = 0xff;
const FALSE_BYTE: u8 = 0x00;

fn block_txs_key(height: u32) -> String {
    format!("spynode/txs/{:08x}", height)
}

/// Current time in milliseconds since the epoch.
///
/// The wall clock is read once and advanced with the tokio clock afterwards, so first seen
/// times are monotonic and follow a paused test clock.
pub fn now_millis() -> i64 {
    static ANCHOR: OnceLock<(i64, Instant)> = OnceLock::new();
    let (wall, start) = ANCHOR.get_or_init(|| (chrono::Utc::now().timestamp_millis(), Instant::now()));
    wall + start.elapsed().as_millis() as i64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct UnconfirmedTx {
    /// First seen, in milliseconds.
    time: i64,
    /// A conflict was seen.
    unsafe_: bool,
    /// The safe notification was sent.
    safe: bool,
    /// Verified by the trusted node.
    trusted: bool,
}

impl UnconfirmedTx {
    fn new(safe: bool, unsafe_: bool, trusted: bool) -> Self {
        Self {
            time: now_millis(),
            unsafe_,
            safe,
            trusted,
        }
    }

    fn write<W: Write>(&self, txid: &Hash32, w: &mut W) -> std::io::Result<()> {
        txid.consensus_encode(w)?;
        self.time.consensus_encode(w)?;
        for flag in [self.unsafe_, self.safe, self.trusted] {
            w.write_all(&[if flag {
                TRUE_BYTE
            } else {
                FALSE_BYTE
            }])?;
        }
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> Result<(Hash32, Self), WireError> {
        let txid = Hash32::consensus_decode(r)?;
        let time = i64::consensus_decode(r)?;
        let unsafe_ = u8::consensus_decode(r)? != FALSE_BYTE;
        let safe = u8::consensus_decode(r)? != FALSE_BYTE;
        let trusted = u8::consensus_decode(r)? != FALSE_BYTE;
        Ok((
            txid,
            Self {
                time,
                unsafe_,
                safe,
                trusted,
            },
        ))
    }
}

type Unconfirmed = HashMap<Hash32, UnconfirmedTx>;

fn decode_txids(key: &str, data: &[u8]) -> StorageResult<Vec<Hash32>> {
    if data.len() % 32 != 0 {
        return Err(StorageError::Corruption(format!(
            "Tx file {} has invalid size {}",
            key,
            data.len()
        )));
    }
    data.chunks(32).map(|chunk| Ok(Hash32::from_slice(chunk)?)).collect()
}

fn encode_txids(txids: &[Hash32]) -> Vec<u8> {
    txids.iter().flat_map(|txid| txid.0).collect()
}

/// Tracks which transactions are relevant and which notifications were sent for them.
pub struct TxRepository {
    store: Arc<dyn Storage>,
    unconfirmed: Arc<Mutex<Unconfirmed>>,
    block_lock: Mutex<()>,
}

impl TxRepository {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            unconfirmed: Arc::new(Mutex::new(HashMap::new())),
            block_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        let mut unconfirmed = self.unconfirmed.lock().await;
        unconfirmed.clear();

        let data = match read_optional(self.store.as_ref(), UNCONFIRMED_KEY).await? {
            Some(data) if !data.is_empty() => data,
            _ => {
                tracing::debug!("No unconfirmed txs to load");
                return Ok(());
            }
        };

        let mut cursor = Cursor::new(data.as_slice());
        let version = u8::consensus_decode(&mut cursor)?;
        if version != UNCONFIRMED_VERSION {
            return Err(StorageError::UnsupportedVersion {
                key: UNCONFIRMED_KEY.to_string(),
                version: version as u32,
            });
        }
        while (cursor.position() as usize) < data.len() {
            let (txid, tx) = UnconfirmedTx::read(&mut cursor)?;
            unconfirmed.insert(txid, tx);
        }

        tracing::debug!("Loaded {} unconfirmed txs", unconfirmed.len());
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let unconfirmed = self.unconfirmed.lock().await;
        tracing::debug!("Saving {} unconfirmed txs", unconfirmed.len());
        save_unconfirmed(self.store.as_ref(), &unconfirmed).await
    }

    /// Adds a relevant txid to the unconfirmed set (`height` of `None`) or a block.
    ///
    /// Returns `(added, newly_safe)`. `newly_safe` is only reported for unconfirmed
    /// transactions that become safe with this call.
    pub async fn add(
        &self,
        txid: Hash32,
        trusted: bool,
        safe: bool,
        height: Option<u32>,
    ) -> StorageResult<(bool, bool)> {
        let Some(height) = height else {
            let mut unconfirmed = self.unconfirmed.lock().await;
            if let Some(tx) = unconfirmed.get_mut(&txid) {
                tx.trusted |= trusted;
                let newly_safe = safe && !tx.safe;
                tx.safe |= safe;
                return Ok((false, newly_safe));
            }
            unconfirmed.insert(txid, UnconfirmedTx::new(safe, false, trusted));
            return Ok((true, safe));
        };

        let _lock = self.block_lock.lock().await;
        let mut txids = self.read_block(height).await?;
        if txids.contains(&txid) {
            return Ok((false, false));
        }
        txids.push(txid);
        self.store.write(&block_txs_key(height), &encode_txids(&txids)).await?;
        Ok((true, false))
    }

    /// Returns true when the txid was removed.
    pub async fn remove(&self, txid: &Hash32, height: Option<u32>) -> StorageResult<bool> {
        let Some(height) = height else {
            return Ok(self.unconfirmed.lock().await.remove(txid).is_some());
        };

        let _lock = self.block_lock.lock().await;
        let mut txids = self.read_block(height).await?;
        let Some(position) = txids.iter().position(|t| t == txid) else {
            return Ok(false);
        };
        txids.remove(position);
        self.store.write(&block_txs_key(height), &encode_txids(&txids)).await?;
        Ok(true)
    }

    pub async fn contains(&self, txid: &Hash32, height: Option<u32>) -> StorageResult<bool> {
        let Some(height) = height else {
            return Ok(self.unconfirmed.lock().await.contains_key(txid));
        };

        let _lock = self.block_lock.lock().await;
        Ok(self.read_block(height).await?.contains(txid))
    }

    /// Locks the unconfirmed set for the processing of one block.
    ///
    /// Other unconfirmed operations wait until the guard is finalized or released.
    pub async fn lock_unconfirmed(&self) -> UnconfirmedGuard {
        let guard = self.unconfirmed.clone().lock_owned().await;
        let remaining: Vec<Hash32> = guard.keys().copied().collect();
        UnconfirmedGuard {
            store: self.store.clone(),
            snapshot: remaining.iter().copied().collect(),
            remaining,
            guard,
        }
    }

    /// Locks block lists and returns the txids of one block.
    pub async fn get_block(&self, height: u32) -> StorageResult<BlockTxs<'_>> {
        let guard = self.block_lock.lock().await;
        let txids = self.read_block(height).await?;
        Ok(BlockTxs {
            repo: self,
            height,
            txids,
            _guard: guard,
        })
    }

    /// Replaces the unconfirmed set (`None`) or a block list.
    pub async fn set_block(&self, txids: &[Hash32], height: Option<u32>) -> StorageResult<()> {
        let Some(height) = height else {
            let mut unconfirmed = self.unconfirmed.lock().await;
            retain_listed(&mut unconfirmed, txids);
            return Ok(());
        };

        let _lock = self.block_lock.lock().await;
        if txids.is_empty() {
            remove_if_exists(self.store.as_ref(), &block_txs_key(height)).await
        } else {
            self.store.write(&block_txs_key(height), &encode_txids(txids)).await
        }
    }

    pub async fn clear_block(&self, height: Option<u32>) -> StorageResult<()> {
        let Some(height) = height else {
            self.unconfirmed.lock().await.clear();
            return Ok(());
        };

        let _lock = self.block_lock.lock().await;
        remove_if_exists(self.store.as_ref(), &block_txs_key(height)).await
    }

    /// Marks an unconfirmed tx as double spent, adding it when unknown.
    pub async fn mark_unsafe(&self, txid: Hash32) {
        let mut unconfirmed = self.unconfirmed.lock().await;
        mark_unsafe(&mut unconfirmed, txid);
    }

    /// Marks an unconfirmed tx as verified by the trusted node. The safe delay restarts.
    pub async fn mark_trusted(&self, txid: &Hash32) {
        let mut unconfirmed = self.unconfirmed.lock().await;
        if let Some(tx) = unconfirmed.get_mut(txid) {
            if !tx.trusted {
                tracing::debug!(txid = %txid, "Tx marked trusted");
                tx.time = now_millis();
                tx.trusted = true;
            }
        }
    }

    /// Unconfirmed txs that became safe: first seen at or before `cutoff` (milliseconds),
    /// never marked unsafe, and trusted directly or through the mempool. They are marked
    /// safe so they are returned once.
    pub async fn get_new_safe(&self, mempool: &MemPool, cutoff: i64) -> Vec<Hash32> {
        let mut unconfirmed = self.unconfirmed.lock().await;
        let mut result = Vec::new();
        for (txid, tx) in unconfirmed.iter_mut() {
            if tx.safe || tx.unsafe_ || tx.time > cutoff {
                continue;
            }
            if !tx.trusted && !mempool.is_trusted(txid).await {
                continue;
            }
            tx.safe = true;
            result.push(*txid);
        }
        result
    }

    /// First seen time of an unconfirmed tx, in milliseconds.
    pub async fn first_seen(&self, txid: &Hash32) -> Option<i64> {
        self.unconfirmed.lock().await.get(txid).map(|tx| tx.time)
    }

    pub async fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.lock().await.len()
    }

    async fn read_block(&self, height: u32) -> StorageResult<Vec<Hash32>> {
        let key = block_txs_key(height);
        match read_optional(self.store.as_ref(), &key).await? {
            Some(data) => decode_txids(&key, &data),
            None => Ok(Vec::new()),
        }
    }
}

fn mark_unsafe(unconfirmed: &mut Unconfirmed, txid: Hash32) {
    unconfirmed
        .entry(txid)
        .and_modify(|tx| tx.unsafe_ = true)
        .or_insert_with(|| UnconfirmedTx::new(false, true, false));
}

/// Keeps the listed txids, adding missing ones as trusted.
fn retain_listed(unconfirmed: &mut Unconfirmed, txids: &[Hash32]) {
    let mut updated = HashMap::with_capacity(txids.len());
    for txid in txids {
        let tx = unconfirmed.get(txid).copied().unwrap_or_else(|| UnconfirmedTx::new(false, false, true));
        updated.insert(*txid, tx);
    }
    *unconfirmed = updated;
}

async fn save_unconfirmed(store: &dyn Storage, unconfirmed: &Unconfirmed) -> StorageResult<()> {
    if unconfirmed.is_empty() {
        return remove_if_exists(store, UNCONFIRMED_KEY).await;
    }

    let mut data = Vec::with_capacity(1 + unconfirmed.len() * 43);
    data.push(UNCONFIRMED_VERSION);
    for (txid, tx) in unconfirmed {
        tx.write(txid, &mut data)?;
    }
    store.write(UNCONFIRMED_KEY, &data).await
}

/// Exclusive access to the unconfirmed set while a block is processed.
///
/// Confirmed txids are taken out of the snapshot with [`UnconfirmedGuard::remove`];
/// [`UnconfirmedGuard::finalize`] then keeps only the remaining ones. Dropping the guard
/// without finalizing leaves the set unchanged.
pub struct UnconfirmedGuard {
    store: Arc<dyn Storage>,
    /// Txids unconfirmed when the lock was taken.
    snapshot: HashSet<Hash32>,
    remaining: Vec<Hash32>,
    guard: OwnedMutexGuard<Unconfirmed>,
}

impl UnconfirmedGuard {
    /// Whether the txid was unconfirmed when the lock was taken.
    pub fn was_unconfirmed(&self, txid: &Hash32) -> bool {
        self.snapshot.contains(txid)
    }

    /// Whether the txid is still unconfirmed in this block.
    pub fn contains(&self, txid: &Hash32) -> bool {
        self.remaining.contains(txid)
    }

    /// Takes a confirmed txid out of the snapshot. Returns false when it was not there.
    pub fn remove(&mut self, txid: &Hash32) -> bool {
        match self.remaining.iter().position(|t| t == txid) {
            Some(position) => {
                self.remaining.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn mark_unsafe(&mut self, txid: Hash32) {
        mark_unsafe(&mut self.guard, txid);
    }

    pub fn remaining(&self) -> &[Hash32] {
        &self.remaining
    }

    /// Keeps the remaining txids as the unconfirmed set, saves it and releases the lock.
    pub async fn finalize(mut self) -> StorageResult<()> {
        retain_listed(&mut self.guard, &self.remaining);
        save_unconfirmed(self.store.as_ref(), &self.guard).await
    }

    /// Releases the lock without changes.
    pub fn release(self) {}
}

/// Exclusive access to the block txid lists, holding the txids of one block.
pub struct BlockTxs<'a> {
    repo: &'a TxRepository,
    height: u32,
    pub txids: Vec<Hash32>,
    _guard: MutexGuard<'a, ()>,
}

impl BlockTxs<'_> {
    /// Deletes the block's list and releases the lock.
    pub async fn remove(self) -> StorageResult<()> {
        remove_if_exists(self.repo.store.as_ref(), &block_txs_key(self.height)).await
    }

    /// Releases the lock without changes.
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::wire::{OutPoint, Transaction, TxIn};

    fn repo() -> (Arc<MemoryStorage>, TxRepository) {
        let store = Arc::new(MemoryStorage::new());
        (store.clone(), TxRepository::new(store))
    }

    fn txid(i: u8) -> Hash32 {
        Hash32::hash(&[i])
    }

    #[tokio::test]
    async fn test_add_unconfirmed() {
        let (_, txs) = repo();
        assert_eq!(txs.add(txid(1), false, false, None).await.unwrap(), (true, false));
        assert_eq!(txs.add(txid(1), true, false, None).await.unwrap(), (false, false));
        assert_eq!(txs.add(txid(1), false, true, None).await.unwrap(), (false, true));
        assert_eq!(txs.add(txid(1), false, true, None).await.unwrap(), (false, false));
        assert_eq!(txs.add(txid(2), false, true, None).await.unwrap(), (true, true));
        assert!(txs.contains(&txid(1), None).await.unwrap());
        assert!(txs.remove(&txid(1), None).await.unwrap());
        assert!(!txs.remove(&txid(1), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_block_lists() {
        let (store, txs) = repo();
        assert_eq!(txs.add(txid(1), true, true, Some(10)).await.unwrap(), (true, false));
        assert_eq!(txs.add(txid(2), true, true, Some(10)).await.unwrap(), (true, false));
        assert_eq!(txs.add(txid(1), true, true, Some(10)).await.unwrap(), (false, false));
        assert_eq!(store.read("spynode/txs/0000000a").await.unwrap().len(), 64);

        assert!(txs.contains(&txid(2), Some(10)).await.unwrap());
        assert!(txs.remove(&txid(1), Some(10)).await.unwrap());
        assert!(!txs.contains(&txid(1), Some(10)).await.unwrap());

        let block = txs.get_block(10).await.unwrap();
        assert_eq!(block.txids, vec![txid(2)]);
        block.remove().await.unwrap();
        assert!(txs.get_block(10).await.unwrap().txids.is_empty());

        txs.set_block(&[txid(3), txid(4)], Some(11)).await.unwrap();
        assert_eq!(txs.get_block(11).await.unwrap().txids, vec![txid(3), txid(4)]);
        txs.clear_block(Some(11)).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unconfirmed_persistence() {
        let (store, txs) = repo();
        txs.add(txid(1), true, false, None).await.unwrap();
        txs.add(txid(2), false, true, None).await.unwrap();
        txs.mark_unsafe(txid(3)).await;
        txs.save().await.unwrap();

        let data = store.read(UNCONFIRMED_KEY).await.unwrap();
        assert_eq!(data.len(), 1 + 3 * 43);
        assert_eq!(data[0], 0);

        let reloaded = TxRepository::new(store.clone());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.unconfirmed_count().await, 3);
        assert_eq!(reloaded.first_seen(&txid(1)).await, txs.first_seen(&txid(1)).await);
        // Already safe, so only the new flag matters.
        assert_eq!(reloaded.add(txid(2), false, true, None).await.unwrap(), (false, false));

        txs.clear_block(None).await.unwrap();
        txs.save().await.unwrap();
        assert!(store.read(UNCONFIRMED_KEY).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unsupported_version() {
        let (store, txs) = repo();
        store.write(UNCONFIRMED_KEY, &[3]).await.unwrap();
        assert!(matches!(
            txs.load().await,
            Err(StorageError::UnsupportedVersion {
                version: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_get_new_safe() {
        let (_, txs) = repo();
        let mempool = MemPool::new();

        txs.add(txid(1), true, false, None).await.unwrap();
        txs.add(txid(2), false, false, None).await.unwrap();
        txs.add(txid(3), true, false, None).await.unwrap();
        txs.mark_unsafe(txid(3)).await;
        let seen = txs.first_seen(&txid(1)).await.unwrap();

        assert!(txs.get_new_safe(&mempool, seen - 1).await.is_empty());
        assert_eq!(txs.get_new_safe(&mempool, now_millis()).await, vec![txid(1)]);
        assert!(txs.get_new_safe(&mempool, now_millis()).await.is_empty());

        // Trusted through the mempool.
        let tx = Transaction {
            version: 1,
            input: vec![TxIn {
                previous_output: OutPoint::new(txid(9), 0),
                script_sig: vec![],
                sequence: 0,
            }],
            output: vec![],
            lock_time: 0,
        };
        txs.add(tx.txid(), false, false, None).await.unwrap();
        mempool.add_transaction(&tx, true).await;
        assert_eq!(txs.get_new_safe(&mempool, now_millis()).await, vec![tx.txid()]);
        assert!(!txs.get_new_safe(&mempool, now_millis()).await.contains(&txid(2)));
    }

    #[tokio::test]
    async fn test_mark_trusted_restarts_delay() {
        let (_, txs) = repo();
        txs.add(txid(1), false, false, None).await.unwrap();
        let seen = txs.first_seen(&txid(1)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        txs.mark_trusted(&txid(1)).await;
        assert!(txs.first_seen(&txid(1)).await.unwrap() > seen);
        // Unknown txids are not added.
        txs.mark_trusted(&txid(2)).await;
        assert_eq!(txs.unconfirmed_count().await, 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_guard() {
        let (_, txs) = repo();
        for i in 1..=3 {
            txs.add(txid(i), true, false, None).await.unwrap();
        }

        let mut guard = txs.lock_unconfirmed().await;
        assert!(guard.remove(&txid(2)));
        assert!(!guard.remove(&txid(2)));
        assert!(guard.was_unconfirmed(&txid(2)));
        assert!(!guard.contains(&txid(2)));
        guard.mark_unsafe(txid(3));
        guard.finalize().await.unwrap();

        assert_eq!(txs.unconfirmed_count().await, 2);
        assert!(!txs.contains(&txid(2), None).await.unwrap());
        // Unsafe txs never become safe.
        let mempool = MemPool::new();
        assert_eq!(txs.get_new_safe(&mempool, now_millis()).await, vec![txid(1)]);

        // Released without changes.
        let mut guard = txs.lock_unconfirmed().await;
        guard.remove(&txid(1));
        guard.release();
        assert!(txs.contains(&txid(1), None).await.unwrap());
    }
}
