use crate::core::Transaction;
use data_encoding::HEXLOWER;
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

/// Transactions received but not yet in a stored block.
/// ( K -> txid_hex, V => Transaction )
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, txid: &[u8]) -> Option<Transaction> {
        let pool = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        pool.get(&HEXLOWER.encode(txid)).cloned()
    }

    /// Returns false if a transaction with the same id was already pooled.
    pub fn add(&self, tx: Transaction) -> bool {
        let mut pool = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        pool.insert(HEXLOWER.encode(tx.get_id()), tx).is_none()
    }

    pub fn contains(&self, txid: &[u8]) -> bool {
        let pool = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        pool.contains_key(&HEXLOWER.encode(txid))
    }

    pub fn remove(&self, txid: &[u8]) {
        let mut pool = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        pool.remove(&HEXLOWER.encode(txid));
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pooled transactions ordered by id.
    pub fn get_all(&self) -> Vec<Transaction> {
        let pool = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut txs: Vec<Transaction> = pool.values().cloned().collect();
        txs.sort_by(|a, b| a.get_id().cmp(b.get_id()));
        txs
    }
}

/// Block hashes announced by a peer that are still to be fetched, oldest first.
pub struct BlockInTransit {
    inner: RwLock<VecDeque<Vec<u8>>>,
}

impl Default for BlockInTransit {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit {
            inner: RwLock::new(VecDeque::new()),
        }
    }

    /// Replaces the queue with `blocks`.
    pub fn set(&self, blocks: Vec<Vec<u8>>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = blocks.into();
    }

    pub fn pop_front(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.pop_front()
    }

    pub fn clear(&self) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
