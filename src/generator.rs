//! Block production.

use crate::block::{Block, BlockCodec, BlockHeader, ConsensusMode, FIRST_BLOCK_ID};
use crate::cadence::BlockTimeCounter;
use crate::config::{ConsensusConfig, NodeConfig};
use crate::crypto::KeyPair;
use crate::daemon::{Job, JobContext};
use crate::error::{ChainError, Result};
use crate::leader::{select_leader, window_size};
use crate::persistence::InfoBlock;
use crate::role::{NodeMode, NodeRoleResolver};
use crate::state::{ChainGuard, ChainState};
use crate::transport::PeerTransport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer slot resolved for one tick.
struct Slot {
    mode: ConsensusMode,
    position: u64,
    candidate_nodes: Option<Vec<u8>>,
    hosts: Vec<String>,
}

pub struct BlockGenerator {
    state: Arc<ChainState>,
    roles: Arc<NodeRoleResolver>,
    codec: Arc<dyn BlockCodec>,
    transport: Arc<dyn PeerTransport>,
    keypair: KeyPair,
    node: NodeConfig,
    consensus: ConsensusConfig,
    peer_timeout: Duration,
}

impl BlockGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<ChainState>,
        roles: Arc<NodeRoleResolver>,
        codec: Arc<dyn BlockCodec>,
        transport: Arc<dyn PeerTransport>,
        keypair: KeyPair,
        node: NodeConfig,
        consensus: ConsensusConfig,
        peer_timeout: Duration,
    ) -> Self {
        Self {
            state,
            roles,
            codec,
            transport,
            keypair,
            node,
            consensus,
            peer_timeout,
        }
    }

    /// Creates block 1 on an empty chain. Only the first-block key holder may
    /// do this.
    pub async fn create_first_block(&self, now: i64) -> Result<InfoBlock> {
        if !self.roles.is_first_block_key() {
            return Err(ChainError::NotANode(
                "only the first-block key can create the first block".to_string(),
            ));
        }
        let guard = self.state.lock().await;
        if let Some(head) = self.state.head()? {
            return Err(ChainError::InvalidBlock(format!(
                "chain already initialized at block {}",
                head.block_id
            )));
        }
        let mut block = Block {
            header: BlockHeader {
                block_id: FIRST_BLOCK_ID,
                time: now,
                ecosystem_id: self.node.ecosystem_id,
                key_id: self.node.key_id,
                version: self.node.block_version,
                mrkl_root: Block::calculate_merkle_root(&[]),
                ..Default::default()
            },
            prev_header: None,
            transactions: Vec::new(),
        };
        block.header.rollbacks_hash = self.state.pipeline().apply(&block)?;
        block.header.sign_with(&self.keypair)?;
        let raw = self.codec.serialize(&block)?;
        let info = self.state.append_block(&guard, &block, raw)?;
        info!(block_id = info.block_id, "first block created");
        Ok(info)
    }

    /// One generation attempt at time `now`. Returns the new head when a
    /// block was produced. The slot is decided and the block built under one
    /// hold of the chain lock, so sync cannot move the head in between.
    pub async fn generate(&self, cancel: &CancellationToken, now: i64) -> Result<Option<InfoBlock>> {
        let guard = self.state.lock_cancellable(cancel).await?;
        let slot = match self.resolve_slot(now)? {
            Some(slot) => slot,
            None => {
                drop(guard);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.consensus.candidate_backoff) => {}
                }
                return Ok(None);
            }
        };
        let produced = self.produce(&guard, now, &slot)?;
        drop(guard);

        if let Some((info, raw, tx_hashes)) = &produced {
            self.broadcast(&slot.hosts, raw, tx_hashes).await;
            debug!(block_id = info.block_id, "block broadcast");
        }
        Ok(produced.map(|(info, _, _)| info))
    }

    /// This node's producer slot for `now`, or `None` when another candidate
    /// leads. Must be called with the chain lock held.
    fn resolve_slot(&self, now: i64) -> Result<Option<Slot>> {
        let mode = self.roles.resolve(self.state.store())?;
        let slot = match &mode {
            NodeMode::Honor(honor) => {
                let position = honor.position()?;
                let counter = BlockTimeCounter::new(&self.consensus, honor.node_count());
                if counter.block_for_time_exists(self.state.store(), now, position)? {
                    return Err(ChainError::NotMyTurn(format!(
                        "position {} already produced a block this slot",
                        position
                    )));
                }
                if !counter.time_to_generate(now, position) {
                    return Err(ChainError::NotMyTurn(format!(
                        "slot belongs to position {:?}",
                        counter.node_position(now)
                    )));
                }
                Slot {
                    mode: ConsensusMode::Honor,
                    position,
                    candidate_nodes: None,
                    hosts: mode.hosts_for_sync(),
                }
            }
            NodeMode::Candidate(candidate) => {
                candidate.position()?;
                let head = self.state.head()?.ok_or(ChainError::EmptyChain)?;
                let window = window_size(candidate.candidates().len());
                let recent: Vec<u64> = self
                    .state
                    .store()
                    .recent_blocks(window)?
                    .iter()
                    .map(|b| b.node_position)
                    .collect();
                let leader = select_leader(
                    candidate.candidates(),
                    &recent,
                    head.node_position,
                    self.roles.first_block_public_key(),
                )
                .ok_or_else(|| ChainError::NotMyTurn("no eligible leader".to_string()))?;

                if !leader.public_key.eq_ignore_ascii_case(self.roles.public_key()) {
                    debug!(leader = leader.id, head = head.block_id, "another candidate leads, backing off");
                    return Ok(None);
                }
                Slot {
                    mode: ConsensusMode::Candidate,
                    position: leader.id,
                    candidate_nodes: Some(serde_json::to_vec(candidate.candidates())?),
                    hosts: mode.hosts_for_sync(),
                }
            }
        };
        Ok(Some(slot))
    }

    fn produce(
        &self,
        guard: &ChainGuard<'_>,
        now: i64,
        slot: &Slot,
    ) -> Result<Option<(InfoBlock, Vec<u8>, Vec<crate::crypto::Hash>)>> {
        let head = self.state.head()?.ok_or(ChainError::EmptyChain)?;
        let pipeline = self.state.pipeline();

        pipeline.submit_scheduled(now)?;
        let transactions = pipeline.submit_pending_batch(self.consensus.max_tx_per_block)?;
        if transactions.is_empty() {
            debug!(head = head.block_id, "no transactions, skipping block");
            return Ok(None);
        }

        let mut block = Block {
            header: BlockHeader {
                block_id: head.block_id + 1,
                time: now.max(head.time),
                ecosystem_id: self.node.ecosystem_id,
                key_id: self.node.key_id,
                node_position: slot.position,
                version: self.node.block_version,
                consensus_mode: slot.mode,
                candidate_nodes: slot.candidate_nodes.clone(),
                prev_hash: head.hash,
                prev_rollbacks_hash: head.rollbacks_hash,
                mrkl_root: Block::calculate_merkle_root(&transactions),
                ..Default::default()
            },
            prev_header: None,
            transactions,
        };

        block.header.rollbacks_hash = pipeline.apply(&block)?;
        let stored = block
            .header
            .sign_with(&self.keypair)
            .and_then(|_| self.codec.serialize(&block))
            .and_then(|raw| {
                let info = self.state.append_block(guard, &block, raw.clone())?;
                Ok((info, raw))
            });
        let (info, raw) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                if let Err(undo) = pipeline.rollback(&block) {
                    warn!(error = %undo, "rollback of unsaved block failed");
                }
                return Err(e);
            }
        };

        info!(
            block_id = info.block_id,
            txs = block.transactions.len(),
            position = slot.position,
            mode = ?slot.mode,
            "block generated"
        );
        Ok(Some((info, raw, block.tx_hashes())))
    }

    async fn broadcast(&self, hosts: &[String], raw: &[u8], tx_hashes: &[crate::crypto::Hash]) {
        if hosts.is_empty() {
            return;
        }
        match timeout(
            self.peer_timeout,
            self.transport
                .broadcast_block_and_tx_hashes(hosts, raw, tx_hashes),
        )
        .await
        {
            Ok(Ok(())) => {
                if let Err(e) = self.state.store().mark_transactions_sent(tx_hashes) {
                    warn!(error = %e, "failed to mark transactions sent");
                }
            }
            Ok(Err(e)) => warn!(error = %e, "block broadcast failed"),
            Err(_) => warn!("block broadcast timed out"),
        }
    }
}

#[async_trait]
impl Job for BlockGenerator {
    fn name(&self) -> &'static str {
        "block_generator"
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        self.generate(ctx.cancel_token(), chrono::Utc::now().timestamp())
            .await
            .map(|_| ())
    }
}
