//! Fork repair.
//!
//! Walks a peer's chain backward from the fork point until a validly signed
//! block links onto the local chain, then swaps the local suffix for the
//! peer's. The VM object table, the chain rows and every transaction status
//! row the repair touches are snapshotted first and put back exactly if
//! anything fails half way.

use crate::ban::BanService;
use crate::block::{Block, BlockCodec};
use crate::crypto::SignatureService;
use crate::error::{ChainError, Result};
use crate::crypto::Hash;
use crate::persistence::{ChainStore, InfoBlock, StoredBlock, TransactionStatus};
use crate::pipeline::VmSnapshot;
use crate::role::NodeRoleResolver;
use crate::state::{ChainGuard, ChainState};
use crate::transport::PeerTransport;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

pub struct ForkResolver {
    state: Arc<ChainState>,
    roles: Arc<NodeRoleResolver>,
    codec: Arc<dyn BlockCodec>,
    transport: Arc<dyn PeerTransport>,
    signer: Arc<dyn SignatureService>,
    bans: Arc<dyn BanService>,
    peer_timeout: Duration,
    rollback_blocks: usize,
}

/// Local rows touched so far, in the order they were touched.
#[derive(Default)]
struct Journal {
    removed: Vec<StoredBlock>,
    inserted: Vec<u64>,
    /// Transaction status rows as they were before each mark.
    statuses: Vec<(Hash, Option<TransactionStatus>)>,
    /// Rows reset by the verified-unused sweep.
    swept: Vec<TransactionStatus>,
}

impl Journal {
    fn record_statuses(&mut self, store: &dyn ChainStore, hashes: &[Hash]) -> Result<()> {
        for hash in hashes {
            self.statuses.push((*hash, store.transaction_status(hash)?));
        }
        Ok(())
    }
}

impl ForkResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<ChainState>,
        roles: Arc<NodeRoleResolver>,
        codec: Arc<dyn BlockCodec>,
        transport: Arc<dyn PeerTransport>,
        signer: Arc<dyn SignatureService>,
        bans: Arc<dyn BanService>,
        peer_timeout: Duration,
        rollback_blocks: usize,
    ) -> Self {
        Self {
            state,
            roles,
            codec,
            transport,
            signer,
            bans,
            peer_timeout,
            rollback_blocks,
        }
    }

    fn ban(&self, host: &str, block_id: u64, block_time: i64, reason: &str) -> ChainError {
        self.bans.register_bad_block(host, block_id, block_time, reason);
        ChainError::BadBlock {
            host: host.to_string(),
            reason: format!("block {}: {}", block_id, reason),
        }
    }

    /// Replaces the local chain from `start_id` downward with `host`'s
    /// version. At least `min_count` blocks are replaced. Returns the new
    /// head.
    pub async fn resolve(
        &self,
        guard: &ChainGuard<'_>,
        host: &str,
        start_id: u64,
        min_count: usize,
    ) -> Result<InfoBlock> {
        info!(host = %host, start_id, min_count, "fork detected, repairing");
        let fetched = self.fetch_replacement(host, start_id, min_count).await?;

        let previous_head = self.state.head()?.ok_or(ChainError::EmptyChain)?;
        let snapshot = self.state.pipeline().snapshot_vm()?;
        self.state.pipeline().clean_cache();
        let mut journal = Journal {
            swept: self.state.store().verified_unused_transactions()?,
            ..Default::default()
        };
        self.state.mark_verified_unused_unverified(guard)?;

        let branch_id = fetched
            .last()
            .map(|(block, _)| block.header.block_id - 1)
            .ok_or_else(|| ChainError::ForkNotFound(format!("{} sent no blocks", host)))?;

        let outcome = match self.rollback_to(guard, branch_id, previous_head.block_id, &mut journal) {
            Ok(()) => self.replay(guard, host, &fetched, &mut journal),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(head) => {
                info!(
                    host = %host,
                    branch = branch_id,
                    removed = journal.removed.len(),
                    head = head.block_id,
                    "fork repaired"
                );
                Ok(head)
            }
            Err(e) => {
                error!(host = %host, error = %e, "fork repair failed, restoring previous chain");
                self.restore(guard, &journal, &previous_head, snapshot)?;
                Err(e)
            }
        }
    }

    /// Validly signed replacement blocks, newest first, ending with the
    /// first block that links onto the local chain.
    async fn fetch_replacement(
        &self,
        host: &str,
        start_id: u64,
        min_count: usize,
    ) -> Result<Vec<(Block, Vec<u8>)>> {
        let mut stream = timeout(
            self.peer_timeout,
            self.transport
                .stream_block_bodies(host, start_id, self.rollback_blocks as u32, true),
        )
        .await
        .map_err(|_| ChainError::Timeout(host.to_string()))??;

        let store = self.state.store();
        let mut expected = start_id;
        let mut fetched = Vec::new();
        loop {
            let raw = match timeout(self.peer_timeout, stream.next()).await {
                Ok(Some(raw)) => raw?,
                Ok(None) => break,
                Err(_) => return Err(ChainError::Timeout(host.to_string())),
            };
            let block = self
                .codec
                .parse(&raw)
                .map_err(|e| self.ban(host, expected, 0, &format!("unparseable: {}", e)))?;
            let header = &block.header;
            if header.block_id != expected {
                return Err(self.ban(
                    host,
                    header.block_id,
                    header.time,
                    &format!("expected block {}", expected),
                ));
            }
            if header.block_id < 2 {
                return Err(self.ban(host, header.block_id, header.time, "the first block cannot be replaced"));
            }
            let key = self
                .roles
                .public_key_for(header, store)
                .map_err(|e| self.ban(host, header.block_id, header.time, &e.to_string()))?;
            if !self.signer.verify(&key, &header.signing_payload(), &header.sign) {
                return Err(self.ban(host, header.block_id, header.time, "bad producer signature"));
            }

            let prev_hash = header.prev_hash;
            let block_id = header.block_id;
            fetched.push((block, raw));
            expected -= 1;

            if fetched.len() >= min_count {
                if let Some(local) = store.block(block_id - 1)? {
                    if local.hash == prev_hash {
                        return Ok(fetched);
                    }
                }
            }
            if fetched.len() >= self.rollback_blocks {
                break;
            }
        }
        Err(ChainError::ForkNotFound(format!(
            "{} blocks from {} never link onto the local chain",
            fetched.len(),
            host
        )))
    }

    fn rollback_to(
        &self,
        guard: &ChainGuard<'_>,
        branch_id: u64,
        head_id: u64,
        journal: &mut Journal,
    ) -> Result<()> {
        let store = self.state.store();
        for id in (branch_id + 1..=head_id).rev() {
            let stored = store.block(id)?.ok_or_else(|| {
                ChainError::DatabaseError(format!("block {} missing during rollback", id))
            })?;
            let block = self.codec.parse(&stored.data)?;
            self.state.pipeline().rollback(&block)?;
            let hashes = block.tx_hashes();
            journal.record_statuses(store, &hashes)?;
            self.state.mark_transactions_unverified(guard, &hashes)?;
            self.state.delete_block(guard, id)?;
            journal.removed.push(stored);
        }
        let branch = store.block(branch_id)?.ok_or_else(|| {
            ChainError::DatabaseError(format!("branch block {} missing", branch_id))
        })?;
        self.state.set_head(guard, &branch.to_info())
    }

    fn replay(
        &self,
        guard: &ChainGuard<'_>,
        host: &str,
        fetched: &[(Block, Vec<u8>)],
        journal: &mut Journal,
    ) -> Result<InfoBlock> {
        let store = self.state.store();
        let mut head = None;
        for (block, raw) in fetched.iter().rev() {
            let mut block = block.clone();
            let id = block.header.block_id;
            let prev = store.block(id - 1)?.ok_or_else(|| {
                ChainError::DatabaseError(format!("block {} missing during replay", id - 1))
            })?;
            block.prev_header = Some(self.codec.parse(&prev.data)?.header);

            if let Err(e) = self.codec.verify(&block) {
                return Err(self.ban(host, id, block.header.time, &e.to_string()));
            }
            let rollbacks_hash = self
                .state
                .pipeline()
                .apply(&block)
                .map_err(|e| self.ban(host, id, block.header.time, &e.to_string()))?;
            if rollbacks_hash != block.header.rollbacks_hash {
                return Err(self.ban(host, id, block.header.time, "rollbacks hash mismatch on replay"));
            }
            journal.record_statuses(store, &block.tx_hashes())?;
            journal.inserted.push(id);
            head = Some(self.state.append_block(guard, &block, raw.clone())?);
        }
        head.ok_or_else(|| ChainError::ForkNotFound(format!("{} sent no blocks", host)))
    }

    fn restore(
        &self,
        guard: &ChainGuard<'_>,
        journal: &Journal,
        previous_head: &InfoBlock,
        snapshot: VmSnapshot,
    ) -> Result<()> {
        for id in journal.inserted.iter().rev() {
            self.state.delete_block(guard, *id)?;
        }
        for stored in journal.removed.iter().rev() {
            self.state.insert_block(guard, stored)?;
        }
        for (hash, status) in journal.statuses.iter().rev() {
            self.state
                .restore_transaction_status(guard, hash, status.as_ref())?;
        }
        for status in &journal.swept {
            self.state
                .restore_transaction_status(guard, &status.hash, Some(status))?;
        }
        self.state.set_head(guard, previous_head)?;
        self.state.pipeline().restore_vm(snapshot)?;
        warn!(head = previous_head.block_id, "previous chain restored");
        Ok(())
    }
}
