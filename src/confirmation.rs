//! Block confirmation tracking.
//!
//! Polls sync hosts for their hash of recent blocks and records how many
//! agree with the local chain. Polling is slow while the node is warming up
//! or lagging and fast once confirmations keep up with the head.

use crate::daemon::{Job, JobContext};
use crate::error::{ChainError, Result};
use crate::persistence::Confirmation;
use crate::role::NodeRoleResolver;
use crate::state::ChainState;
use crate::transport::PeerTransport;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const SLOW_INTERVAL: Duration = Duration::from_secs(10);
pub const FAST_INTERVAL: Duration = Duration::from_secs(1);
/// Ticks spent at the slow cadence after startup.
pub const WARMUP_TICKS: u32 = 12;
/// Unconfirmed blocks tolerated before falling back to the slow cadence.
pub const MAX_LAG: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRound {
    pub next_interval: Duration,
    /// Tallies written this round, highest block first.
    pub recorded: Vec<Confirmation>,
}

pub struct ConfirmationTracker {
    state: Arc<ChainState>,
    roles: Arc<NodeRoleResolver>,
    transport: Arc<dyn PeerTransport>,
    peer_timeout: Duration,
    min_confirmed_nodes: u32,
    tick: AtomicU32,
}

impl ConfirmationTracker {
    pub fn new(
        state: Arc<ChainState>,
        roles: Arc<NodeRoleResolver>,
        transport: Arc<dyn PeerTransport>,
        peer_timeout: Duration,
        min_confirmed_nodes: usize,
    ) -> Self {
        Self {
            state,
            roles,
            transport,
            peer_timeout,
            min_confirmed_nodes: min_confirmed_nodes as u32,
            tick: AtomicU32::new(0),
        }
    }

    /// Picks the cadence for the next tick and advances the tick counter.
    fn next_interval(&self, lag: u64) -> Duration {
        if lag > MAX_LAG {
            self.tick.store(0, Ordering::Relaxed);
            return SLOW_INTERVAL;
        }
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        if tick < WARMUP_TICKS {
            SLOW_INTERVAL
        } else {
            FAST_INTERVAL
        }
    }

    async fn tally(&self, hosts: &[String], block_id: u64, local_hash: [u8; 32]) -> (u32, u32) {
        let answers = join_all(hosts.iter().map(|host| async move {
            match timeout(self.peer_timeout, self.transport.query_block_hash(host, block_id)).await {
                Ok(Ok(Some(hash))) => hash == local_hash,
                Ok(Ok(None)) => false,
                Ok(Err(e)) => {
                    debug!(host = %host, block_id, error = %e, "hash query failed");
                    false
                }
                Err(_) => {
                    debug!(host = %host, block_id, "hash query timed out");
                    false
                }
            }
        }))
        .await;
        let good = answers.iter().filter(|agrees| **agrees).count() as u32;
        (good, answers.len() as u32 - good)
    }

    pub async fn check(&self, cancel: &CancellationToken, now: i64) -> Result<ConfirmationRound> {
        let store = self.state.store();
        let head = self.state.head()?.ok_or(ChainError::EmptyChain)?.block_id;
        let last_good = store
            .last_good_confirmation(self.min_confirmed_nodes)?
            .map(|c| c.block_id)
            .unwrap_or(0);
        let lag = head.saturating_sub(last_good);
        let next_interval = self.next_interval(lag);
        let start = if lag > MAX_LAG { last_good + 1 } else { head };

        let hosts = self.roles.resolve(store)?.hosts_for_sync();
        let mut recorded = Vec::new();
        for block_id in (start..=head).rev() {
            if cancel.is_cancelled() {
                break;
            }
            let local = match store.block(block_id)? {
                Some(local) => local,
                None => continue,
            };
            let (good, bad) = self.tally(&hosts, block_id, local.hash).await;
            let confirmation = Confirmation {
                block_id,
                good,
                bad,
                time: now,
            };
            {
                let guard = self.state.lock_cancellable(cancel).await?;
                self.state.save_confirmation(&guard, &confirmation)?;
            }
            recorded.push(confirmation);
            if good >= self.min_confirmed_nodes {
                info!(block_id, good, bad, "block confirmed");
                break;
            }
        }

        Ok(ConfirmationRound {
            next_interval,
            recorded,
        })
    }
}

#[async_trait]
impl Job for ConfirmationTracker {
    fn name(&self) -> &'static str {
        "confirmations"
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let round = self
            .check(ctx.cancel_token(), chrono::Utc::now().timestamp())
            .await?;
        ctx.set_interval(round.next_interval);
        Ok(())
    }
}
