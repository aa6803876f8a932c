//! In-memory backend, useful for tests and ephemeral runs.

use super::{
    CandidateNode, ChainStore, Confirmation, InfoBlock, StoredBlock, TransactionStatus,
};
use crate::crypto::Hash;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    info: Option<InfoBlock>,
    blocks: BTreeMap<u64, StoredBlock>,
    candidates: BTreeMap<u64, CandidateNode>,
    confirmations: BTreeMap<u64, Confirmation>,
    transactions: HashMap<Hash, TransactionStatus>,
    installed: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already carries the installation marker.
    pub fn installed() -> Self {
        let store = Self::default();
        store.inner.lock().installed = true;
        store
    }
}

impl ChainStore for MemoryStore {
    fn info_block(&self) -> Result<Option<InfoBlock>> {
        Ok(self.inner.lock().info.clone())
    }

    fn set_info_block(&self, info: &InfoBlock) -> Result<()> {
        self.inner.lock().info = Some(info.clone());
        Ok(())
    }

    fn block(&self, id: u64) -> Result<Option<StoredBlock>> {
        Ok(self.inner.lock().blocks.get(&id).cloned())
    }

    fn insert_block(&self, block: &StoredBlock) -> Result<()> {
        self.inner.lock().blocks.insert(block.id, block.clone());
        Ok(())
    }

    fn delete_block(&self, id: u64) -> Result<()> {
        self.inner.lock().blocks.remove(&id);
        Ok(())
    }

    fn recent_blocks(&self, count: usize) -> Result<Vec<StoredBlock>> {
        let inner = self.inner.lock();
        Ok(inner.blocks.values().rev().take(count).cloned().collect())
    }

    fn count_node_blocks_between(
        &self,
        start: i64,
        end: i64,
        node_position: u64,
    ) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(inner
            .blocks
            .values()
            .filter(|b| b.time >= start && b.time < end && b.node_position == node_position)
            .count())
    }

    fn candidate_nodes(&self) -> Result<Vec<CandidateNode>> {
        Ok(self.inner.lock().candidates.values().cloned().collect())
    }

    fn save_candidate_node(&self, node: &CandidateNode) -> Result<()> {
        self.inner.lock().candidates.insert(node.id, node.clone());
        Ok(())
    }

    fn increment_reply_count(&self, id: u64) -> Result<()> {
        if let Some(node) = self.inner.lock().candidates.get_mut(&id) {
            node.reply_count += 1;
        }
        Ok(())
    }

    fn save_confirmation(&self, confirmation: &Confirmation) -> Result<()> {
        self.inner
            .lock()
            .confirmations
            .insert(confirmation.block_id, *confirmation);
        Ok(())
    }

    fn confirmation(&self, block_id: u64) -> Result<Option<Confirmation>> {
        Ok(self.inner.lock().confirmations.get(&block_id).copied())
    }

    fn last_good_confirmation(&self, min_good: u32) -> Result<Option<Confirmation>> {
        let inner = self.inner.lock();
        Ok(inner
            .confirmations
            .values()
            .rev()
            .find(|c| c.good >= min_good)
            .copied())
    }

    fn save_transaction_status(&self, status: &TransactionStatus) -> Result<()> {
        self.inner.lock().transactions.insert(status.hash, *status);
        Ok(())
    }

    fn transaction_status(&self, hash: &Hash) -> Result<Option<TransactionStatus>> {
        Ok(self.inner.lock().transactions.get(hash).copied())
    }

    fn delete_transaction_status(&self, hash: &Hash) -> Result<()> {
        self.inner.lock().transactions.remove(hash);
        Ok(())
    }

    fn verified_unused_transactions(&self) -> Result<Vec<TransactionStatus>> {
        let inner = self.inner.lock();
        Ok(inner
            .transactions
            .values()
            .filter(|s| s.verified && !s.used)
            .copied()
            .collect())
    }

    fn mark_transactions_sent(&self, hashes: &[Hash]) -> Result<()> {
        let mut inner = self.inner.lock();
        for hash in hashes {
            let status = inner.transactions.entry(*hash).or_insert(TransactionStatus {
                hash: *hash,
                ..Default::default()
            });
            status.sent = true;
        }
        Ok(())
    }

    fn mark_transactions_used(&self, block_id: u64, hashes: &[Hash]) -> Result<()> {
        let mut inner = self.inner.lock();
        for hash in hashes {
            let status = inner.transactions.entry(*hash).or_insert(TransactionStatus {
                hash: *hash,
                ..Default::default()
            });
            status.verified = true;
            status.used = true;
            status.block_id = Some(block_id);
        }
        Ok(())
    }

    fn mark_transactions_unverified(&self, hashes: &[Hash]) -> Result<()> {
        let mut inner = self.inner.lock();
        for hash in hashes {
            if let Some(status) = inner.transactions.get_mut(hash) {
                status.verified = false;
                status.used = false;
                status.block_id = None;
            }
        }
        Ok(())
    }

    fn mark_verified_unused_unverified(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for status in inner.transactions.values_mut() {
            if status.verified && !status.used {
                status.verified = false;
            }
        }
        Ok(())
    }

    fn is_installed(&self) -> Result<bool> {
        Ok(self.inner.lock().installed)
    }

    fn set_installed(&self) -> Result<()> {
        self.inner.lock().installed = true;
        Ok(())
    }
}
