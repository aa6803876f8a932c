//! Node role resolution.
//!
//! A node runs in honor mode while the candidate registry is empty and in
//! candidate mode once anyone registers. The mode is recomputed on every call
//! from a fresh registry read; nothing about it is persisted.

use crate::ban::BanService;
use crate::block::{BlockHeader, ConsensusMode, FIRST_BLOCK_ID};
use crate::config::{Config, HonorNode};
use crate::crypto::KeyPair;
use crate::error::{ChainError, Result};
use crate::persistence::{CandidateNode, ChainStore};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HonorNodeMode {
    nodes: Vec<HonorNode>,
    public_key: String,
    tcp_address: String,
    hosts: Vec<String>,
}

impl HonorNodeMode {
    /// Index of this node in the honor list.
    pub fn position(&self) -> Result<u64> {
        self.nodes
            .iter()
            .position(|n| n.public_key.eq_ignore_ascii_case(&self.public_key))
            .map(|i| i as u64)
            .ok_or_else(|| {
                ChainError::NotANode(format!("{} is not in the honor node list", self.public_key))
            })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tcp_address(&self) -> &str {
        &self.tcp_address
    }
}

#[derive(Debug, Clone)]
pub struct CandidateNodeMode {
    candidates: Vec<CandidateNode>,
    public_key: String,
    tcp_address: String,
}

impl CandidateNodeMode {
    /// Registry id of this node.
    pub fn position(&self) -> Result<u64> {
        self.me().map(|c| c.id).ok_or_else(|| {
            ChainError::NotANode(format!("{} is not a registered candidate", self.public_key))
        })
    }

    pub fn me(&self) -> Option<&CandidateNode> {
        self.candidates
            .iter()
            .find(|c| c.node_pub_key.eq_ignore_ascii_case(&self.public_key))
    }

    /// Registry snapshot, sorted by id.
    pub fn candidates(&self) -> &[CandidateNode] {
        &self.candidates
    }
}

#[derive(Debug, Clone)]
pub enum NodeMode {
    Honor(HonorNodeMode),
    Candidate(CandidateNodeMode),
}

impl NodeMode {
    pub fn position(&self) -> Result<u64> {
        match self {
            NodeMode::Honor(mode) => mode.position(),
            NodeMode::Candidate(mode) => mode.position(),
        }
    }

    /// Remote hosts to pull blocks from and push blocks to.
    pub fn hosts_for_sync(&self) -> Vec<String> {
        match self {
            NodeMode::Honor(mode) => mode.hosts.clone(),
            NodeMode::Candidate(mode) => mode
                .candidates
                .iter()
                .filter(|c| c.tcp_address != mode.tcp_address)
                .map(|c| c.tcp_address.clone())
                .collect(),
        }
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeMode::Candidate(_))
    }
}

pub struct NodeRoleResolver {
    honor_nodes: Vec<HonorNode>,
    public_key: String,
    tcp_address: String,
    first_block_public_key: String,
    bans: Arc<dyn BanService>,
}

impl NodeRoleResolver {
    pub fn new(config: &Config, keypair: &KeyPair, bans: Arc<dyn BanService>) -> Self {
        Self {
            honor_nodes: config.network.honor_nodes.clone(),
            public_key: keypair.public_key_hex(),
            tcp_address: config.node.tcp_address.clone(),
            first_block_public_key: config.consensus.first_block_public_key.clone(),
            bans,
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn tcp_address(&self) -> &str {
        &self.tcp_address
    }

    pub fn first_block_public_key(&self) -> &str {
        &self.first_block_public_key
    }

    pub fn is_first_block_key(&self) -> bool {
        self.public_key
            .eq_ignore_ascii_case(&self.first_block_public_key)
    }

    pub fn resolve(&self, store: &dyn ChainStore) -> Result<NodeMode> {
        let mut candidates = store.candidate_nodes()?;
        if candidates.is_empty() {
            let hosts = self
                .honor_nodes
                .iter()
                .filter(|n| n.tcp_address != self.tcp_address)
                .map(|n| n.tcp_address.clone())
                .collect();
            return Ok(NodeMode::Honor(HonorNodeMode {
                nodes: self.honor_nodes.clone(),
                public_key: self.public_key.clone(),
                tcp_address: self.tcp_address.clone(),
                hosts: self.bans.filter_banned_hosts(hosts),
            }));
        }
        candidates.sort_by_key(|c| c.id);
        Ok(NodeMode::Candidate(CandidateNodeMode {
            candidates,
            public_key: self.public_key.clone(),
            tcp_address: self.tcp_address.clone(),
        }))
    }

    /// Public key of the producer of `header`, decided by the block's own
    /// consensus mode. Candidate producers are looked up in the local
    /// registry; the header's snapshot must agree with it.
    pub fn public_key_for(&self, header: &BlockHeader, store: &dyn ChainStore) -> Result<Vec<u8>> {
        if header.block_id == FIRST_BLOCK_ID {
            return Ok(hex::decode(&self.first_block_public_key)?);
        }
        let key = match header.consensus_mode {
            ConsensusMode::Honor => self
                .honor_nodes
                .get(header.node_position as usize)
                .map(|n| n.public_key.clone())
                .ok_or_else(|| {
                    ChainError::InvalidBlock(format!(
                        "block {} names honor position {} outside the list",
                        header.block_id, header.node_position
                    ))
                })?,
            ConsensusMode::Candidate if header.node_position == 0 => {
                self.first_block_public_key.clone()
            }
            ConsensusMode::Candidate => {
                let key = store
                    .candidate_nodes()?
                    .into_iter()
                    .find(|c| c.id == header.node_position)
                    .map(|c| c.node_pub_key)
                    .ok_or_else(|| {
                        ChainError::InvalidBlock(format!(
                            "block {} names unknown candidate {}",
                            header.block_id, header.node_position
                        ))
                    })?;
                if let Some(snapshot) = &header.candidate_nodes {
                    let snapshot: Vec<CandidateNode> = serde_json::from_slice(snapshot)?;
                    let disagrees = snapshot.iter().any(|c| {
                        c.id == header.node_position && !c.node_pub_key.eq_ignore_ascii_case(&key)
                    });
                    if disagrees {
                        return Err(ChainError::InvalidBlock(format!(
                            "block {} carries a registry snapshot that disagrees on candidate {}",
                            header.block_id, header.node_position
                        )));
                    }
                }
                key
            }
        };
        Ok(hex::decode(key)?)
    }
}
