//! Node assembly.
//!
//! Wires the configured store, the external collaborators and every daemon
//! job into one [`Node`], and drives install and the scheduler run.

use crate::ban::{BanList, BanService};
use crate::block::BlockCodec;
use crate::config::{load_config, Config};
use crate::confirmation::ConfirmationTracker;
use crate::crypto::{KeyPair, SignatureService};
use crate::daemon::{spawn_signal_handler, DaemonScheduler, Job};
use crate::error::Result;
use crate::fork::ForkResolver;
use crate::generator::BlockGenerator;
use crate::persistence::{ChainStore, Database, MemoryStore};
use crate::pipeline::TransactionPipeline;
use crate::role::NodeRoleResolver;
use crate::state::ChainState;
use crate::sync::ChainSynchronizer;
use crate::transport::PeerTransport;
use crate::voting::CandidateVotingCoordinator;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// External collaborators a node is assembled from.
pub struct Collaborators {
    pub store: Arc<dyn ChainStore>,
    pub pipeline: Arc<dyn TransactionPipeline>,
    pub transport: Arc<dyn PeerTransport>,
    pub codec: Arc<dyn BlockCodec>,
    pub signer: Arc<dyn SignatureService>,
}

pub struct Node {
    pub config: Config,
    pub state: Arc<ChainState>,
    pub roles: Arc<NodeRoleResolver>,
    pub bans: Arc<BanList>,
    pub generator: Arc<BlockGenerator>,
    pub synchronizer: Arc<ChainSynchronizer>,
    pub voting: Arc<CandidateVotingCoordinator>,
    pub confirmations: Arc<ConfirmationTracker>,
    cancel: CancellationToken,
}

impl Node {
    /// Installs the global fmt subscriber. Safe to call more than once.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Opens the SQLite store named in the config, falling back to an
    /// in-memory store when it cannot be opened.
    pub fn open_store(config: &Config) -> Arc<dyn ChainStore> {
        let path = Path::new(&config.database.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent) {
                    warn!("Failed to create data dir {:?}: {}", parent, e);
                }
            }
        }
        match Database::open(&config.database.path) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!(
                    "Failed to open DB at {}: {}. Falling back to in-memory persistence.",
                    config.database.path, e
                );
                Arc::new(MemoryStore::new())
            }
        }
    }

    pub fn load(path: impl AsRef<Path>, collaborators: Collaborators) -> Result<Self> {
        Self::new(load_config(path)?, collaborators)
    }

    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let keypair = KeyPair::from_secret_hex(&config.node.private_key)?;
        let Collaborators {
            store,
            pipeline,
            transport,
            codec,
            signer,
        } = collaborators;

        let state = Arc::new(ChainState::new(store, pipeline));
        let bans = Arc::new(BanList::new(&config.ban));
        let ban_service: Arc<dyn BanService> = bans.clone();
        let roles = Arc::new(NodeRoleResolver::new(&config, &keypair, ban_service.clone()));

        let generator = Arc::new(BlockGenerator::new(
            state.clone(),
            roles.clone(),
            codec.clone(),
            transport.clone(),
            keypair.clone(),
            config.node.clone(),
            config.consensus.clone(),
            config.network.peer_timeout,
        ));
        let fork = ForkResolver::new(
            state.clone(),
            roles.clone(),
            codec.clone(),
            transport.clone(),
            signer.clone(),
            ban_service.clone(),
            config.network.peer_timeout,
            config.consensus.rollback_blocks,
        );
        let synchronizer = Arc::new(ChainSynchronizer::new(
            state.clone(),
            roles.clone(),
            codec,
            transport.clone(),
            signer.clone(),
            fork,
            ban_service,
            config.network.bootstrap_nodes.clone(),
            config.network.peer_timeout,
            config.network.blocks_per_request,
        ));
        let voting = Arc::new(CandidateVotingCoordinator::new(
            state.clone(),
            roles.clone(),
            transport.clone(),
            signer,
            keypair,
            config.network.peer_timeout,
            config.consensus.vote_max_age,
        ));
        let confirmations = Arc::new(ConfirmationTracker::new(
            state.clone(),
            roles.clone(),
            transport,
            config.network.peer_timeout,
            config.consensus.min_confirmed_nodes,
        ));

        Ok(Self {
            config,
            state,
            roles,
            bans,
            generator,
            synchronizer,
            voting,
            confirmations,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Completes installation. The first-block key holder also writes block 1
    /// when the chain is empty; every other node fetches it through sync.
    pub async fn install(&self, now: i64) -> Result<()> {
        if self.state.head()?.is_none() && self.roles.is_first_block_key() {
            self.generator.create_first_block(now).await?;
        }
        self.state.store().set_installed()?;
        info!("installation complete");
        Ok(())
    }

    pub fn scheduler(&self) -> Result<DaemonScheduler> {
        let daemons = &self.config.daemons;
        let mut scheduler = DaemonScheduler::new(
            self.state.shared_store(),
            self.cancel.clone(),
            daemons.install_poll,
        )?;
        let jobs = [
            (self.generator.clone() as Arc<dyn Job>, daemons.block_generator),
            (self.synchronizer.clone() as Arc<dyn Job>, daemons.blocks_collection),
            (self.voting.clone() as Arc<dyn Job>, daemons.candidate_voting),
            (self.confirmations.clone() as Arc<dyn Job>, daemons.confirmations),
        ];
        for (job, interval) in jobs {
            scheduler.register(job, interval);
        }
        Ok(scheduler)
    }

    /// Runs every job until ctrl-c, SIGTERM or [`Node::cancel_token`] fires.
    pub async fn run(&self) -> Result<()> {
        info!(
            address = %self.config.node.tcp_address,
            public_key = %self.roles.public_key(),
            "starting node"
        );
        let signals = spawn_signal_handler(self.cancel.clone());
        let stopped = self.scheduler()?.run().await;
        signals.abort();
        let stopped = stopped?;
        info!(jobs = ?stopped, "node stopped");
        Ok(())
    }
}
