//! Guarded access to chain state.
//!
//! [`ChainState`] owns the store, the transaction pipeline and the single
//! process-wide chain lock. Every method that mutates the chain head, the
//! block rows, the candidate registry or the confirmation records takes a
//! [`ChainGuard`], so callers cannot write without holding the lock.
//! Dropping the guard clears the shared transaction cache.

use crate::block::Block;
use crate::crypto::Hash;
use crate::error::{ChainError, Result};
use crate::persistence::{ChainStore, Confirmation, InfoBlock, StoredBlock, TransactionStatus};
use crate::pipeline::TransactionPipeline;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub struct ChainState {
    store: Arc<dyn ChainStore>,
    pipeline: Arc<dyn TransactionPipeline>,
    lock: Mutex<()>,
}

/// Proof that the global chain lock is held.
pub struct ChainGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    pipeline: &'a dyn TransactionPipeline,
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        // Runs before the mutex guard field is released.
        self.pipeline.clean_cache();
        trace!("chain lock released");
    }
}

impl ChainState {
    pub fn new(store: Arc<dyn ChainStore>, pipeline: Arc<dyn TransactionPipeline>) -> Self {
        Self {
            store,
            pipeline,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &dyn ChainStore {
        self.store.as_ref()
    }

    pub fn shared_store(&self) -> Arc<dyn ChainStore> {
        self.store.clone()
    }

    pub fn pipeline(&self) -> &dyn TransactionPipeline {
        self.pipeline.as_ref()
    }

    pub async fn lock(&self) -> ChainGuard<'_> {
        let guard = self.lock.lock().await;
        trace!("chain lock acquired");
        ChainGuard {
            _lock: guard,
            pipeline: self.pipeline.as_ref(),
        }
    }

    /// Waits for the lock unless `cancel` fires first.
    pub async fn lock_cancellable(&self, cancel: &CancellationToken) -> Result<ChainGuard<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChainError::Cancelled),
            guard = self.lock() => Ok(guard),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn head(&self) -> Result<Option<InfoBlock>> {
        self.store.info_block()
    }

    /// Current head id, 0 for an empty chain.
    pub fn head_id(&self) -> Result<u64> {
        Ok(self.store.info_block()?.map(|info| info.block_id).unwrap_or(0))
    }

    /// Persists an executed block and advances the head onto it.
    pub fn append_block(
        &self,
        _guard: &ChainGuard<'_>,
        block: &Block,
        data: Vec<u8>,
    ) -> Result<InfoBlock> {
        let stored = StoredBlock {
            id: block.header.block_id,
            hash: block.hash(),
            rollbacks_hash: block.header.rollbacks_hash,
            node_position: block.header.node_position,
            time: block.header.time,
            tx_count: block.transactions.len() as u32,
            data,
        };
        self.store.insert_block(&stored)?;
        let info = stored.to_info();
        self.store.set_info_block(&info)?;
        self.store
            .mark_transactions_used(stored.id, &block.tx_hashes())?;
        Ok(info)
    }

    pub fn insert_block(&self, _guard: &ChainGuard<'_>, block: &StoredBlock) -> Result<()> {
        self.store.insert_block(block)
    }

    pub fn delete_block(&self, _guard: &ChainGuard<'_>, id: u64) -> Result<()> {
        self.store.delete_block(id)
    }

    pub fn set_head(&self, _guard: &ChainGuard<'_>, info: &InfoBlock) -> Result<()> {
        self.store.set_info_block(info)
    }

    pub fn mark_transactions_unverified(
        &self,
        _guard: &ChainGuard<'_>,
        hashes: &[Hash],
    ) -> Result<()> {
        self.store.mark_transactions_unverified(hashes)
    }

    pub fn mark_verified_unused_unverified(&self, _guard: &ChainGuard<'_>) -> Result<()> {
        self.store.mark_verified_unused_unverified()
    }

    /// Puts a status row back as it was; `None` removes it.
    pub fn restore_transaction_status(
        &self,
        _guard: &ChainGuard<'_>,
        hash: &Hash,
        status: Option<&TransactionStatus>,
    ) -> Result<()> {
        match status {
            Some(status) => self.store.save_transaction_status(status),
            None => self.store.delete_transaction_status(hash),
        }
    }

    pub fn save_confirmation(
        &self,
        _guard: &ChainGuard<'_>,
        confirmation: &Confirmation,
    ) -> Result<()> {
        self.store.save_confirmation(confirmation)
    }

    pub fn increment_reply_count(&self, _guard: &ChainGuard<'_>, id: u64) -> Result<()> {
        self.store.increment_reply_count(id)
    }
}
