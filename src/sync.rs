//! Chain synchronization.
//!
//! Each tick finds the peer with the highest chain, downloads the missing
//! blocks in fixed-size batches and applies them one by one under the global
//! chain lock. A hash-chain or rollbacks-hash break hands over to
//! [`ForkResolver`].

use crate::ban::BanService;
use crate::block::{Block, BlockCodec};
use crate::crypto::SignatureService;
use crate::daemon::{Job, JobContext};
use crate::error::{ChainError, Result};
use crate::fork::ForkResolver;
use crate::role::NodeRoleResolver;
use crate::state::{ChainGuard, ChainState};
use crate::transport::PeerTransport;
use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one sync tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No peer answered the height query.
    NoPeers,
    UpToDate { local: u64, remote: u64 },
    Applied { host: String, from: u64, to: u64 },
    ForkRepaired { host: String, head: u64 },
}

/// What applying one downloaded block led to.
enum Step {
    Applied,
    Fork { start_id: u64, window: usize },
}

pub struct ChainSynchronizer {
    state: Arc<ChainState>,
    roles: Arc<NodeRoleResolver>,
    codec: Arc<dyn BlockCodec>,
    transport: Arc<dyn PeerTransport>,
    signer: Arc<dyn SignatureService>,
    fork: ForkResolver,
    bans: Arc<dyn BanService>,
    bootstrap_nodes: Vec<String>,
    peer_timeout: Duration,
    blocks_per_request: u32,
}

impl ChainSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<ChainState>,
        roles: Arc<NodeRoleResolver>,
        codec: Arc<dyn BlockCodec>,
        transport: Arc<dyn PeerTransport>,
        signer: Arc<dyn SignatureService>,
        fork: ForkResolver,
        bans: Arc<dyn BanService>,
        bootstrap_nodes: Vec<String>,
        peer_timeout: Duration,
        blocks_per_request: u32,
    ) -> Self {
        Self {
            state,
            roles,
            codec,
            transport,
            signer,
            fork,
            bans,
            bootstrap_nodes,
            peer_timeout,
            blocks_per_request: blocks_per_request.max(1),
        }
    }

    async fn poll_heights(&self, hosts: &[String]) -> Option<(String, u64)> {
        let answers = join_all(hosts.iter().map(|host| async move {
            match timeout(self.peer_timeout, self.transport.query_max_block_id(host)).await {
                Ok(Ok(max_id)) => Some((host.clone(), max_id)),
                Ok(Err(e)) => {
                    debug!(host = %host, error = %e, "height query failed");
                    None
                }
                Err(_) => {
                    debug!(host = %host, "height query timed out");
                    None
                }
            }
        }))
        .await;

        // First host wins ties so the choice follows configuration order.
        answers
            .into_iter()
            .flatten()
            .fold(None, |best: Option<(String, u64)>, (host, max_id)| match best {
                Some((_, best_id)) if best_id >= max_id => best,
                _ => Some((host, max_id)),
            })
    }

    /// Host with the highest chain among the sync hosts, falling back to the
    /// bootstrap list when none of them answers. Banned hosts are skipped in
    /// both lists.
    pub async fn discover_best_host(&self) -> Result<Option<(String, u64)>> {
        let hosts = self.roles.resolve(self.state.store())?.hosts_for_sync();
        if let Some(best) = self.poll_heights(&hosts).await {
            return Ok(Some(best));
        }
        let bootstrap = self.bans.filter_banned_hosts(self.bootstrap_nodes.clone());
        if bootstrap.is_empty() {
            return Ok(None);
        }
        debug!("no sync host answered, trying bootstrap nodes");
        Ok(self.poll_heights(&bootstrap).await)
    }

    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let (host, remote) = match self.discover_best_host().await? {
            Some(best) => best,
            None => {
                warn!("no peer answered the height query");
                return Ok(SyncOutcome::NoPeers);
            }
        };
        let local = self.state.head_id()?;
        if local >= remote {
            return Ok(SyncOutcome::UpToDate { local, remote });
        }

        let guard = self.state.lock_cancellable(cancel).await?;
        let from = self.state.head_id()? + 1;
        info!(host = %host, from, to = remote, "syncing blocks");

        let mut head = from - 1;
        'batches: while head < remote {
            if cancel.is_cancelled() {
                break;
            }
            let count = self
                .blocks_per_request
                .min(u32::try_from(remote - head).unwrap_or(u32::MAX));
            let mut stream = timeout(
                self.peer_timeout,
                self.transport.stream_block_bodies(&host, head + 1, count, false),
            )
            .await
            .map_err(|_| ChainError::Timeout(host.clone()))??;

            let batch_start = head;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break 'batches,
                    next = timeout(self.peer_timeout, stream.next()) => next,
                };
                let raw = match next {
                    Ok(Some(raw)) => raw?,
                    Ok(None) => break,
                    Err(_) => return Err(ChainError::Timeout(host.clone())),
                };
                match self.apply_next(&guard, &raw)? {
                    Step::Applied => head += 1,
                    Step::Fork { start_id, window } => {
                        let repaired = self.fork.resolve(&guard, &host, start_id, window).await?;
                        return Ok(SyncOutcome::ForkRepaired {
                            host,
                            head: repaired.block_id,
                        });
                    }
                }
            }
            if head == batch_start {
                return Err(ChainError::NetworkError(format!(
                    "{} advertised block {} but sent nothing after {}",
                    host, remote, head
                )));
            }
        }

        drop(guard);
        if head >= from {
            info!(host = %host, from, to = head, "sync applied blocks");
        }
        Ok(SyncOutcome::Applied { host, from, to: head })
    }

    fn apply_next(&self, guard: &ChainGuard<'_>, raw: &[u8]) -> Result<Step> {
        let store = self.state.store();
        let mut block: Block = self.codec.parse(raw)?;
        let head = self.state.head_id()?;
        let block_id = block.header.block_id;
        if block_id != head + 1 {
            return Err(ChainError::HeadRace {
                expected: head + 1,
                found: block_id,
            });
        }
        if head > 0 {
            let prev = store.block(head)?.ok_or_else(|| {
                ChainError::DatabaseError(format!("head block {} has no stored body", head))
            })?;
            block.prev_header = Some(self.codec.parse(&prev.data)?.header);
        }

        if let Err(e) = self.codec.verify(&block) {
            return match e.fork_window() {
                Some(window) => {
                    warn!(block_id, error = %e, "fork signal");
                    Ok(Step::Fork {
                        start_id: head,
                        window,
                    })
                }
                None => Err(e.into()),
            };
        }

        let key = self.roles.public_key_for(&block.header, store)?;
        if !self
            .signer
            .verify(&key, &block.header.signing_payload(), &block.header.sign)
        {
            return Err(ChainError::InvalidBlock(format!(
                "block {} has a bad producer signature",
                block_id
            )));
        }

        let pipeline = self.state.pipeline();
        let rollbacks_hash = pipeline.apply(&block)?;
        if rollbacks_hash != block.header.rollbacks_hash {
            warn!(block_id, "executed rollbacks hash differs from header");
            pipeline.rollback(&block)?;
            return Ok(Step::Fork {
                start_id: head,
                window: 2,
            });
        }
        self.state.append_block(guard, &block, raw.to_vec())?;
        debug!(block_id, "block applied");
        Ok(Step::Applied)
    }
}

#[async_trait]
impl Job for ChainSynchronizer {
    fn name(&self) -> &'static str {
        "blocks_collection"
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        self.sync(ctx.cancel_token()).await.map(|_| ())
    }
}
