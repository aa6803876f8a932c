//! Block structure, hashing and the wire codec.

use crate::crypto::{Hash, KeyPair};
use crate::error::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Block id of the first block in the chain. It has no predecessor and is
/// the only block allowed to carry no transactions.
pub const FIRST_BLOCK_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsensusMode {
    #[default]
    Honor,
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_id: u64,
    /// Unix seconds.
    pub time: i64,
    pub ecosystem_id: u64,
    pub key_id: i64,
    /// Honor-list index or candidate id of the producer.
    pub node_position: u64,
    pub version: u32,
    pub consensus_mode: ConsensusMode,
    /// JSON snapshot of the candidate registry the producer elected itself from.
    pub candidate_nodes: Option<Vec<u8>>,
    pub prev_hash: Hash,
    /// Producer's view of the predecessor's rollbacks hash.
    pub prev_rollbacks_hash: Hash,
    pub mrkl_root: Hash,
    /// Digest of the undo records produced by executing this block.
    pub rollbacks_hash: Hash,
    pub sign: Vec<u8>,
}

impl BlockHeader {
    /// Bytes the block hash covers. The block's own rollbacks hash is left
    /// out so a diverged execution digest does not break the hash chain.
    fn hash_payload(&self) -> String {
        let candidates = self
            .candidate_nodes
            .as_deref()
            .map(crate::crypto::sha256)
            .unwrap_or_default();
        format!(
            "{},{},{},{},{},{},{},{},{:?},{},{}",
            self.block_id,
            hex::encode(self.prev_hash),
            hex::encode(self.mrkl_root),
            self.time,
            self.ecosystem_id,
            self.key_id,
            self.node_position,
            self.version,
            self.consensus_mode,
            hex::encode(self.prev_rollbacks_hash),
            hex::encode(candidates),
        )
    }

    /// Bytes covered by the producer signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!("{},{}", self.hash_payload(), hex::encode(self.rollbacks_hash)).into_bytes()
    }

    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.hash_payload().as_bytes());
        hasher.finalize().into()
    }

    pub fn sign_with(&mut self, keypair: &KeyPair) -> Result<()> {
        self.sign = keypair.sign(&self.signing_payload())?.to_vec();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Header of the local predecessor; attached after parsing, never serialized.
    #[serde(skip)]
    pub prev_header: Option<BlockHeader>,
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn is_first(&self) -> bool {
        self.header.block_id == FIRST_BLOCK_ID
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions
            .iter()
            .map(|tx| crate::crypto::sha256(tx))
            .collect()
    }

    pub fn calculate_merkle_root(transactions: &[Vec<u8>]) -> Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(crate::crypto::sha256(tx));
        }
        hasher.finalize().into()
    }
}

/// Parse, check and encode blocks exchanged between nodes.
pub trait BlockCodec: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<Block>;

    /// Checks the block against `block.prev_header`. Hash-chain and
    /// rollbacks-hash breaks come back as fork signals.
    fn verify(&self, block: &Block) -> std::result::Result<(), VerifyError>;

    fn serialize(&self, block: &Block) -> Result<Vec<u8>>;
}

/// Default codec: bincode body, SHA-256 linkage.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BlockCodec for BincodeCodec {
    fn parse(&self, raw: &[u8]) -> Result<Block> {
        Ok(bincode::deserialize(raw)?)
    }

    fn verify(&self, block: &Block) -> std::result::Result<(), VerifyError> {
        let header = &block.header;
        let block_id = header.block_id;
        let invalid = |reason: &str| VerifyError::Invalid {
            block_id,
            reason: reason.to_string(),
        };

        if block.transactions.is_empty() && !block.is_first() {
            return Err(invalid("block carries no transactions"));
        }
        if Block::calculate_merkle_root(&block.transactions) != header.mrkl_root {
            return Err(invalid("merkle root mismatch"));
        }

        let prev = match &block.prev_header {
            Some(prev) => prev,
            None if block.is_first() => return Ok(()),
            None => return Err(invalid("previous header is missing")),
        };

        if prev.block_id + 1 != block_id {
            return Err(invalid("block does not follow its previous header"));
        }
        if header.prev_hash != prev.hash() {
            return Err(VerifyError::HashMismatch { block_id });
        }
        if header.prev_rollbacks_hash != prev.rollbacks_hash {
            return Err(VerifyError::RollbackHashMismatch { block_id });
        }
        if header.time < prev.time {
            return Err(invalid("block time precedes previous block"));
        }
        Ok(())
    }

    fn serialize(&self, block: &Block) -> Result<Vec<u8>> {
        Ok(bincode::serialize(block)?)
    }
}
