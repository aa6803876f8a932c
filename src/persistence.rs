//! Database persistence layer for KernelChain
//!
//! The consensus core only talks to the [`ChainStore`] trait. Two backends
//! ship with the crate: [`Database`] on SQLite and [`MemoryStore`] for tests
//! and ephemeral runs.

pub mod database;
pub mod memory;

pub use database::Database;
pub use memory::MemoryStore;

use crate::crypto::Hash;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// The authoritative chain head.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InfoBlock {
    pub block_id: u64,
    pub hash: Hash,
    pub rollbacks_hash: Hash,
    pub node_position: u64,
    pub time: i64,
}

/// Raw body of an applied block plus the columns the core queries by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub id: u64,
    pub hash: Hash,
    pub rollbacks_hash: Hash,
    pub node_position: u64,
    pub time: i64,
    pub tx_count: u32,
    pub data: Vec<u8>,
}

impl StoredBlock {
    pub fn to_info(&self) -> InfoBlock {
        InfoBlock {
            block_id: self.id,
            hash: self.hash,
            rollbacks_hash: self.rollbacks_hash,
            node_position: self.node_position,
            time: self.time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateNode {
    pub id: u64,
    /// Hex-encoded compressed public key.
    pub node_pub_key: String,
    pub tcp_address: String,
    pub reply_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub block_id: u64,
    pub good: u32,
    pub bad: u32,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionStatus {
    pub hash: Hash,
    pub sent: bool,
    pub verified: bool,
    pub used: bool,
    pub block_id: Option<u64>,
}

/// Storage contract consumed by the consensus core.
pub trait ChainStore: Send + Sync {
    fn info_block(&self) -> Result<Option<InfoBlock>>;
    fn set_info_block(&self, info: &InfoBlock) -> Result<()>;

    fn block(&self, id: u64) -> Result<Option<StoredBlock>>;
    fn insert_block(&self, block: &StoredBlock) -> Result<()>;
    fn delete_block(&self, id: u64) -> Result<()>;
    /// Up to `count` blocks, most recent first.
    fn recent_blocks(&self, count: usize) -> Result<Vec<StoredBlock>>;
    /// Blocks produced by `node_position` with `start <= time < end`.
    fn count_node_blocks_between(&self, start: i64, end: i64, node_position: u64)
        -> Result<usize>;

    fn candidate_nodes(&self) -> Result<Vec<CandidateNode>>;
    fn save_candidate_node(&self, node: &CandidateNode) -> Result<()>;
    fn increment_reply_count(&self, id: u64) -> Result<()>;

    fn save_confirmation(&self, confirmation: &Confirmation) -> Result<()>;
    fn confirmation(&self, block_id: u64) -> Result<Option<Confirmation>>;
    /// Highest block whose latest tally reached `min_good` good answers.
    fn last_good_confirmation(&self, min_good: u32) -> Result<Option<Confirmation>>;

    fn save_transaction_status(&self, status: &TransactionStatus) -> Result<()>;
    fn transaction_status(&self, hash: &Hash) -> Result<Option<TransactionStatus>>;
    fn delete_transaction_status(&self, hash: &Hash) -> Result<()>;
    /// Rows the next `mark_verified_unused_unverified` would reset.
    fn verified_unused_transactions(&self) -> Result<Vec<TransactionStatus>>;
    fn mark_transactions_sent(&self, hashes: &[Hash]) -> Result<()>;
    fn mark_transactions_used(&self, block_id: u64, hashes: &[Hash]) -> Result<()>;
    /// Returns transactions of a discarded block to the unverified pool.
    fn mark_transactions_unverified(&self, hashes: &[Hash]) -> Result<()>;
    fn mark_verified_unused_unverified(&self) -> Result<()>;

    fn is_installed(&self) -> Result<bool>;
    fn set_installed(&self) -> Result<()>;
}
